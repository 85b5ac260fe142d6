//! # wirecall CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve the echo protocol
//! wirecall serve -b 0.0.0.0:9001
//!
//! # Ask a server which protocol version it speaks
//! wirecall version 127.0.0.1:9001
//!
//! # Send one message through a version-checked proxy
//! wirecall echo 127.0.0.1:9001 "hello" --config client.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use argh::FromArgs;
use wirecall_cli::{EchoProtocol, ECHO_PROTOCOL, ECHO_PROTOCOL_VERSION};
use wirecall_client::{get_proxy, stop_proxy, Client, ClientCache, Invoker};
use wirecall_common::transport::{resolve_addr, StandardSocketFactory};
use wirecall_common::TypeRegistry;

#[derive(FromArgs)]
/// wirecall - multiplexed binary RPC over TCP
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Version(VersionArgs),
    Echo(EchoArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve the demo echo protocol
struct ServeArgs {
    /// address to bind to
    ///
    /// Defaults to "0.0.0.0:0" which assigns a random available port.
    /// The actual bound address is logged at startup.
    #[argh(option, short = 'b', default = "\"0.0.0.0:0\".into()")]
    bind: String,

    /// protocol version reported to clients
    #[argh(option, long = "server-version", default = "ECHO_PROTOCOL_VERSION")]
    server_version: i64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "version")]
/// print the protocol version a server speaks
struct VersionArgs {
    /// address of the server, as host:port
    #[argh(positional)]
    server_address: String,

    /// version sent along with the request
    #[argh(option, long = "client-version", default = "ECHO_PROTOCOL_VERSION")]
    client_version: i64,

    /// client config file (JSON, or .properties with ipc.* keys)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "echo")]
/// send a message to an echo server and print the reply
struct EchoArgs {
    /// address of the server, as host:port
    #[argh(positional)]
    server_address: String,

    /// message to send
    #[argh(positional)]
    message: String,

    /// version the server must report
    #[argh(option, long = "client-version", default = "ECHO_PROTOCOL_VERSION")]
    client_version: i64,

    /// client config file (JSON, or .properties with ipc.* keys)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Default to INFO, but allow RUST_LOG to override. Logs go to stderr so
    // replies printed on stdout stay clean for scripting.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => wirecall_cli::serve(&args.bind, args.server_version).await,
        Commands::Version(args) => run_version(args).await,
        Commands::Echo(args) => run_echo(args).await,
    }
}

/// Asks the server for its version without checking it.
async fn run_version(args: VersionArgs) -> Result<()> {
    let config = wirecall_cli::load_config(args.config.as_deref())?;
    let addr = resolve_addr(&args.server_address).await?;

    let client = Arc::new(Client::new(config, Arc::new(TypeRegistry::new())));
    let invoker = Invoker::new(addr, ECHO_PROTOCOL, client.clone());
    let result = invoker
        .get_protocol_version(ECHO_PROTOCOL, args.client_version)
        .await;
    client.stop().await;

    println!("{}", result?);
    Ok(())
}

async fn run_echo(args: EchoArgs) -> Result<()> {
    let config = wirecall_cli::load_config(args.config.as_deref())?;
    let addr = resolve_addr(&args.server_address).await?;
    let cache = ClientCache::new();

    let proxy: EchoProtocol = get_proxy(
        addr,
        args.client_version,
        &config,
        Arc::new(StandardSocketFactory),
        Arc::new(TypeRegistry::new()),
        &cache,
    )
    .await?;

    let start = Instant::now();
    let result = proxy.echo(args.message).await;
    tracing::debug!(elapsed_ms = start.elapsed().as_millis() as u64, "echo finished");
    stop_proxy(proxy, &cache).await;

    println!("{}", result?);
    Ok(())
}

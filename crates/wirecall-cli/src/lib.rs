// Copyright 2025 wirecall Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # wirecall CLI
//!
//! Command-line front end for the wirecall transport.
//!
//! The `wirecall` binary serves a small demo protocol, `demo.EchoProtocol`,
//! and talks to it:
//!
//! - `wirecall serve`: run an echo server
//! - `wirecall version`: ask a server for its protocol version
//! - `wirecall echo`: send one message through a version-checked proxy
//!
//! Client settings come from an optional config file, either JSON with the
//! field names of [`ClientConfig`] or `ipc.*` properties.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use wirecall_client::{rpc_proxy, ClientConfig, GET_PROTOCOL_VERSION};
use wirecall_common::transport::{RpcServer, ServerCall};
use wirecall_common::{RpcError, TypeRegistry, TypedValue};


/// Protocol name served by [`serve`].
pub const ECHO_PROTOCOL: &str = "demo.EchoProtocol";

/// Version of [`ECHO_PROTOCOL`] this build speaks.
pub const ECHO_PROTOCOL_VERSION: i64 = 1;

rpc_proxy! {
    /// Client side of `demo.EchoProtocol`.
    pub struct EchoProtocol: "demo.EchoProtocol" {
        /// Returns `message` unchanged.
        fn echo(message: String) -> String = "echo";
        fn add(a: i32, b: i32) -> i32 = "add";
        /// Returns `words` in reverse order.
        fn reverse(words: Vec<String>) -> Vec<String> = "reverse";
    }
}

/// Answers one call of the echo protocol.
///
/// Unknown methods come back to the caller as a remote
/// `java.lang.NoSuchMethodException`.
pub async fn handle_echo(call: ServerCall, server_version: i64) -> wirecall_common::Result<TypedValue> {
    let method = call.invocation.method_name().to_string();
    let mut params = call.invocation.into_parameters().into_iter();
    let mut arg = || {
        params
            .next()
            .ok_or_else(|| RpcError::protocol(format!("{method}: missing argument")))
    };

    match method.as_str() {
        GET_PROTOCOL_VERSION => Ok(TypedValue::of(server_version)),
        "echo" => arg(),
        "add" => {
            let a: i32 = arg()?.into_wire()?;
            let b: i32 = arg()?.into_wire()?;
            Ok(TypedValue::of(a.wrapping_add(b)))
        }
        "reverse" => {
            let mut words: Vec<String> = arg()?.into_wire()?;
            words.reverse();
            Ok(TypedValue::of(words))
        }
        _ => Err(RpcError::Remote {
            class: "java.lang.NoSuchMethodException".to_string(),
            message: format!("{}.{}", ECHO_PROTOCOL, method),
        }),
    }
}

/// Binds an echo server and serves until the listener fails.
pub async fn serve(bind: &str, server_version: i64) -> Result<()> {
    let server = RpcServer::new(bind, TypeRegistry::new())
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!(
        addr = %server.local_addr()?,
        protocol = ECHO_PROTOCOL,
        version = server_version,
        "Serving"
    );
    server
        .run_with_handler(move |call| handle_echo(call, server_version))
        .await?;
    Ok(())
}

/// Loads client settings from `path`, or the defaults when there is none.
///
/// Files ending in `.properties` hold `key=value` lines with the `ipc.*`
/// keys; anything else is read as JSON.
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let Some(path) = path else {
        return Ok(ClientConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config = if path.extension().is_some_and(|ext| ext == "properties") {
        ClientConfig::from_properties(&parse_properties(&text))?
    } else {
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid JSON in config file {}", path.display()))?
    };
    tracing::debug!(?config, "Loaded client config");
    Ok(config)
}

/// Parses `key=value` lines, skipping blanks and `#` comments.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

//! Length-prefixed framing over async streams.
//!
//! Wire format for every frame:
//!
//! ```text
//! [4-byte length as u32 big-endian] [body]
//! ```
//!
//! A connection opens with the handshake:
//!
//! ```text
//! ["hrpc"] [version: u8] [4-byte header length] [ConnectionHeader]
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::frame::{check_version, ConnectionHeader, CURRENT_VERSION, HEADER};

/// Maximum frame size (100 MB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Validates a length prefix read off the wire.
///
/// # Errors
///
/// Returns `RpcError::Protocol` if the frame exceeds [`MAX_FRAME_SIZE`].
pub fn check_frame_len(len: u32) -> Result<usize> {
    let len = len as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::protocol(format!(
            "Frame too large: {} bytes (max {} bytes)",
            len, MAX_FRAME_SIZE
        )));
    }
    Ok(len)
}

/// Writes one frame and flushes the writer.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(RpcError::InvalidArgument(format!(
            "Frame too large: {} bytes (max {} bytes)",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame body.
///
/// # Errors
///
/// Returns an `UnexpectedEof` I/O error if the peer closes mid-frame, and
/// `RpcError::Protocol` for oversized frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = check_frame_len(u32::from_be_bytes(len_buf))?;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Sends the connection preamble: magic, version and header.
pub async fn write_handshake<W>(writer: &mut W, header: &ConnectionHeader) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(HEADER).await?;
    writer.write_all(&[CURRENT_VERSION]).await?;
    write_frame(writer, &header.to_bytes()?).await
}

/// Reads and validates the connection preamble.
///
/// # Errors
///
/// Returns `RpcError::Protocol` if the magic bytes or the version do not
/// match.
pub async fn read_handshake<R>(reader: &mut R) -> Result<ConnectionHeader>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    if &magic != HEADER {
        return Err(RpcError::protocol(format!(
            "bad connection magic {:?}",
            String::from_utf8_lossy(&magic)
        )));
    }

    let version = reader.read_u8().await?;
    check_version(version)?;

    let body = read_frame(reader).await?;
    ConnectionHeader::from_bytes(&body)
}

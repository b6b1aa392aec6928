//! Frame codec for the echo wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ code(1B) │   payload              │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! Length = sizeof(code byte) + sizeof(payload), NOT including the 4-byte prefix.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read one frame from the stream.
///
/// Returns `(code, payload_bytes)`, or `None` when the peer closed the stream
/// on a frame boundary. EOF inside a frame, including inside the length
/// prefix, is `UnexpectedEof`. Frames longer than `max_frame_bytes` are
/// rejected.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> io::Result<Option<(u8, Vec<u8>)>> {
    let mut prefix = [0u8; 4];
    if reader.read(&mut prefix[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[1..]).await?;

    let frame_len = u32::from_be_bytes(prefix);
    if frame_len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "empty frame, missing command code",
        ));
    }
    if frame_len > max_frame_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {frame_len} bytes exceeds limit of {max_frame_bytes}"),
        ));
    }

    let mut frame = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame).await?;
    let payload = frame.split_off(1);
    Ok(Some((frame[0], payload)))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    code: u8,
    payload: &[u8],
) -> io::Result<()> {
    let frame_len = u32::try_from(payload.len() + 1).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds u32 length")
    })?;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[code]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a frame with a timeout so a slow consumer cannot hold a worker forever.
pub async fn timed_write<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    code: u8,
    payload: &[u8],
    timeout: Duration,
) -> io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, code, payload))
        .await
        .map_err(|_| {
            tracing::warn!("Write timeout ({:?}), dropping connection", timeout);
            io::Error::new(io::ErrorKind::TimedOut, "write timeout")
        })?
}

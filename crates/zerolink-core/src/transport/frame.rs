//! Length-prefixed framing shared by every stream transport.
//!
//! ```text
//! [u32 BE: len][payload bytes of len]
//! ```
//!
//! Topic messages are two consecutive frames: the topic, then the payload.

use crate::config::TransportConfig;
use crate::{Result, ZerolinkError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(ZerolinkError::FrameTooLarge {
            size: len,
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(ZerolinkError::FrameTooLarge {
            size: payload.len(),
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

//! Length-prefixed message frames.
//!
//! ```text
//! +-----------------------------------+
//! | length (4 bytes, big-endian)      |
//! +-----------------------------------+
//! | payload (bincode-encoded Message) |
//! +-----------------------------------+
//! ```

use mesh_types::{Message, MeshError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on a single frame (1 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

pub fn encode(message: &Message, max_frame_size: usize) -> Result<Vec<u8>> {
    let payload = bincode::serialize(message).map_err(|e| MeshError::CodecError(e.to_string()))?;

    if payload.len() > max_frame_size {
        return Err(MeshError::FrameTooLarge {
            len: payload.len(),
            max: max_frame_size,
        });
    }

    let len = u32::try_from(payload.len()).map_err(|_| MeshError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Message> {
    bincode::deserialize(bytes).map_err(|e| MeshError::CodecError(e.to_string()))
}

pub async fn write_frame<W>(writer: &mut W, message: &Message, max_frame_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message, max_frame_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(MeshError::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    decode(&payload).map(Some)
}

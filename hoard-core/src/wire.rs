//! Framing. Every frame starts with one discriminant byte:
//!
//! - `0x01` control frame: 4-byte LE length, then a bincode [`ControlEnvelope`].
//! - `0x02` stream hand-off: raw bytes follow with no framing. Their length
//!   is known to the reader from a control message or a size header.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::ControlEnvelope;

pub const CONTROL_FRAME: u8 = 0x01;
pub const STREAM_HANDOFF: u8 = 0x02;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Width of the size header that precedes a fetch response body.
pub const SIZE_HEADER_LEN: usize = 8;

/// One frame pulled off a connection by its decode loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Remote address of the connection the frame arrived on.
    pub from: String,
    /// Encoded envelope; empty for a stream hand-off.
    pub payload: Vec<u8>,
    pub stream: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown frame discriminant {0:#04x}")]
    UnknownFrame(u8),
    #[error("frame too large")]
    TooLarge,
    #[error("encode error: {0}")]
    Encode(bincode::Error),
    #[error("decode error: {0}")]
    Decode(bincode::Error),
}

/// Encode a control frame: discriminant + 4 bytes LE length + bincode payload.
pub fn encode_control(msg: &ControlEnvelope) -> Result<Vec<u8>, WireError> {
    let payload = bincode::serialize(msg).map_err(WireError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge);
    }
    let mut out = Vec::with_capacity(1 + LEN_SIZE + payload.len());
    out.push(CONTROL_FRAME);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode the payload of a control frame.
pub fn decode_envelope(payload: &[u8]) -> Result<ControlEnvelope, WireError> {
    bincode::deserialize(payload).map_err(WireError::Decode)
}

/// Size header sent right after the hand-off marker of a fetch response.
pub fn encode_size_header(size: u64) -> [u8; SIZE_HEADER_LEN] {
    size.to_le_bytes()
}

pub async fn read_size_header<R>(reader: &mut R) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; SIZE_HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

/// Read exactly one frame. For a hand-off only the marker is consumed; the
/// bytes after it belong to whoever takes over the connection.
pub async fn read_frame<R>(reader: &mut R, from: &str) -> Result<InboundFrame, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let tag = reader.read_u8().await?;
    match tag {
        CONTROL_FRAME => {
            let mut len_buf = [0u8; LEN_SIZE];
            reader.read_exact(&mut len_buf).await?;
            let len = u32::from_le_bytes(len_buf);
            if len > MAX_FRAME_LEN {
                return Err(WireError::TooLarge);
            }
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload).await?;
            Ok(InboundFrame {
                from: from.to_string(),
                payload,
                stream: false,
            })
        }
        STREAM_HANDOFF => Ok(InboundFrame {
            from: from.to_string(),
            payload: Vec::new(),
            stream: true,
        }),
        other => Err(WireError::UnknownFrame(other)),
    }
}

//! Stream Compression Frames
//!
//! A compressed replication stream is a sequence of frames, each a
//! `u32 LE` length followed by that many bytes of an LZ4 block with its
//! uncompressed size prepended.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Upper bound for a single compressed frame on the wire
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound for a frame's decompressed payload
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Compress one chunk into a length-prefixed frame
pub fn encode_frame(chunk: &[u8]) -> Vec<u8> {
    let block = lz4_flex::compress_prepend_size(chunk);
    let mut frame = Vec::with_capacity(4 + block.len());
    frame.extend_from_slice(&(block.len() as u32).to_le_bytes());
    frame.extend_from_slice(&block);
    frame
}

/// Decompress a frame body (without its length prefix)
pub fn decode_block(block: &[u8]) -> Result<Vec<u8>> {
    if block.len() < 4 {
        return Err(Error::Relay {
            endpoint: "decompress".into(),
            reason: "frame shorter than its size prefix".into(),
        });
    }
    let declared = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    if declared > MAX_PAYLOAD_SIZE {
        return Err(Error::Relay {
            endpoint: "decompress".into(),
            reason: format!("frame declares {} bytes, limit is {}", declared, MAX_PAYLOAD_SIZE),
        });
    }
    lz4_flex::decompress_size_prepended(block).map_err(|e| Error::Relay {
        endpoint: "decompress".into(),
        reason: e.to_string(),
    })
}

/// Read the next still-compressed frame body.
///
/// Returns `None` on a clean end of stream between frames. A stream that
/// ends inside a frame is an error.
pub async fn read_block<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(truncated("frame length"));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Relay {
            endpoint: "decompress".into(),
            reason: format!("frame of {} bytes exceeds {}", len, MAX_FRAME_SIZE),
        });
    }

    let mut block = vec![0u8; len];
    reader.read_exact(&mut block).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            truncated("frame body")
        } else {
            Error::Io(e)
        }
    })?;
    Ok(Some(block))
}

fn truncated(part: &str) -> Error {
    Error::Relay {
        endpoint: "decompress".into(),
        reason: format!("stream ended inside {}", part),
    }
}

//! Replication Prelude
//!
//! Metadata header written ahead of the engine byte stream. Layout:
//!
//! ```text
//! +------+------------+-----------+------------------+
//! | DMPL | len u32 LE | crc32 LE  | JSON body (len)  |
//! +------+------------+-----------+------------------+
//! ```
//!
//! Decoding reads exactly the header and body, so the reader handed back
//! yields the engine bytes untouched.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::volume::Snapshot;

/// Magic bytes opening every prelude
pub const MAGIC: [u8; 4] = *b"DMPL";

/// Largest body accepted when decoding
pub const MAX_BODY_SIZE: u32 = 16 * 1024 * 1024;

/// Snapshot records carried by one replication stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prelude {
    pub snapshots: Vec<Snapshot>,
}

impl Prelude {
    pub fn new(snapshots: Vec<Snapshot>) -> Self {
        Self { snapshots }
    }

    /// Build the prelude for a send ending at `to`: every snapshot of the
    /// lineage up to and including it, in lineage order.
    pub fn for_send(filesystem: &str, lineage: &[Snapshot], to: &str) -> Result<Self> {
        let end = lineage
            .iter()
            .position(|s| s.id == to)
            .ok_or_else(|| Error::SnapshotNotFound {
                filesystem: filesystem.to_string(),
                snapshot: to.to_string(),
            })?;
        Ok(Self::new(lineage[..=end].to_vec()))
    }

    /// Serialize to header bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        if body.len() > MAX_BODY_SIZE as usize {
            return Err(Error::MalformedPrelude(format!(
                "prelude body of {} bytes exceeds {} bytes",
                body.len(),
                MAX_BODY_SIZE
            )));
        }
        let header = PreludeHeader::new(&body);

        let mut bytes = Vec::with_capacity(PreludeHeader::SIZE + body.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Read a prelude from the head of `reader`, returning the reader
    /// positioned at the first byte after it.
    pub async fn decode<R: AsyncRead + Unpin>(mut reader: R) -> Result<(Self, R)> {
        let mut header_bytes = [0u8; PreludeHeader::SIZE];
        reader
            .read_exact(&mut header_bytes)
            .await
            .map_err(|e| truncated_or_io(e, "header"))?;
        let header = PreludeHeader::from_bytes(&header_bytes)?;

        let mut body = vec![0u8; header.length as usize];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| truncated_or_io(e, "body"))?;

        let prelude = header.verify_and_parse(&body)?;
        Ok((prelude, reader))
    }
}

fn truncated_or_io(e: std::io::Error, part: &str) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::MalformedPrelude(format!("truncated {}", part))
    } else {
        Error::Io(e)
    }
}

/// Fixed-size header in front of the prelude body
#[derive(Debug, Clone, Copy)]
struct PreludeHeader {
    length: u32,
    checksum: u32,
}

impl PreludeHeader {
    const SIZE: usize = 12;

    fn new(body: &[u8]) -> Self {
        Self {
            length: body.len() as u32,
            checksum: crc32fast::hash(body),
        }
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&MAGIC);
        bytes[4..8].copy_from_slice(&self.length.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8; Self::SIZE]) -> Result<Self> {
        if bytes[0..4] != MAGIC {
            return Err(Error::MalformedPrelude("bad magic".into()));
        }
        let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let checksum = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if length > MAX_BODY_SIZE {
            return Err(Error::MalformedPrelude(format!(
                "declared body of {} bytes exceeds {} bytes",
                length, MAX_BODY_SIZE
            )));
        }
        Ok(Self { length, checksum })
    }

    fn verify_and_parse(&self, body: &[u8]) -> Result<Prelude> {
        if crc32fast::hash(body) != self.checksum {
            return Err(Error::MalformedPrelude("checksum mismatch".into()));
        }
        serde_json::from_slice(body).map_err(|e| Error::MalformedPrelude(e.to_string()))
    }
}

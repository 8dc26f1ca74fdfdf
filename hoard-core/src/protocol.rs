//! Control messages exchanged between nodes. Encoding is bincode; framing
//! is in the wire module.

use serde::{Deserialize, Serialize};

/// Version byte exchanged by the version handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Every control message a node understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlEnvelope {
    /// Sender is about to stream `size` sealed bytes for `key` on this
    /// connection; the receiver keeps them as a replica.
    StoreFile { key: String, size: u64 },
    /// Sender wants `key`; a node holding it answers with a stream hand-off,
    /// an 8-byte size header and the sealed bytes.
    GetFile { key: String },
}

impl ControlEnvelope {
    /// Network key the message refers to.
    pub fn key(&self) -> &str {
        match self {
            ControlEnvelope::StoreFile { key, .. } | ControlEnvelope::GetFile { key } => key,
        }
    }
}

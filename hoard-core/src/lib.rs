//! Hoard: content-addressed file store replicated across TCP peers.
//! Files are kept locally in a sharded layout and pushed, encrypted, to every
//! connected node.

pub mod cipher;
pub mod config;
pub mod identity;
pub mod node;
pub mod path;
pub mod peer;
pub mod protocol;
pub mod store;
pub mod transport;
pub mod wire;

pub use cipher::{decrypt_copy, encrypt_copy, CipherError, IV_SIZE};
pub use config::NodeConfig;
pub use identity::{hash_key, EncryptionKey, KeyParseError, NodeId};
pub use node::{Node, NodeError, PeerRegistry};
pub use path::{cas_path, plain_path, PathKey, PathTransform};
pub use peer::{ConnectionState, Peer, StreamGate, StreamHandle};
pub use protocol::{ControlEnvelope, PROTOCOL_VERSION};
pub use store::{ContentStore, StoreError, DEFAULT_ROOT};
pub use transport::{TcpTransport, TransportError, TransportOpts};
pub use wire::{InboundFrame, WireError};

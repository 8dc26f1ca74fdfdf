//! Node configuration. Loading (files, env) is the host's job; see the
//! daemon crate.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::identity::{EncryptionKey, KeyParseError};
use crate::store::DEFAULT_ROOT;

/// Everything a node needs to start. Immutable once the node is built.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// TCP listen address (default 0.0.0.0:3000).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Directory holding every namespace (default `hoard_network`).
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// Peers dialed at start. Empty entries are skipped.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Hex-encoded 32-byte key shared by the cluster. Generated when absent.
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// Storage namespace. Generated when absent.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Pause between announcing a store and streaming it (default 5 ms).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// How long a fetch waits for peers to answer (default 500 ms).
    #[serde(default = "default_fetch_window_ms")]
    pub fetch_window_ms: u64,
    /// Exchange protocol version bytes on connect instead of the no-op handshake.
    #[serde(default)]
    pub version_handshake: bool,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}
fn default_settle_delay_ms() -> u64 {
    5
}
fn default_fetch_window_ms() -> u64 {
    500
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            storage_root: default_storage_root(),
            bootstrap: Vec::new(),
            encryption_key: None,
            namespace: None,
            settle_delay_ms: default_settle_delay_ms(),
            fetch_window_ms: default_fetch_window_ms(),
            version_handshake: false,
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: impl Into<String>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    /// Configured key, if any.
    pub fn encryption_key(&self) -> Result<Option<EncryptionKey>, KeyParseError> {
        self.encryption_key
            .as_deref()
            .map(EncryptionKey::from_hex)
            .transpose()
    }

    /// Bootstrap addresses with blanks dropped.
    pub fn bootstrap_addrs(&self) -> impl Iterator<Item = &str> {
        self.bootstrap
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn fetch_window(&self) -> Duration {
        Duration::from_millis(self.fetch_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = NodeConfig::default();
        assert_eq!(c.listen_addr, "0.0.0.0:3000");
        assert_eq!(c.storage_root, PathBuf::from("hoard_network"));
        assert!(c.bootstrap.is_empty());
        assert_eq!(c.settle_delay(), Duration::from_millis(5));
        assert_eq!(c.fetch_window(), Duration::from_millis(500));
        assert!(!c.version_handshake);
        assert!(c.encryption_key().unwrap().is_none());
    }

    #[test]
    fn blank_bootstrap_entries_skipped() {
        let mut c = NodeConfig::new("127.0.0.1:0", "/tmp/x");
        c.bootstrap = vec!["".into(), "127.0.0.1:4000".into(), "  ".into()];
        assert_eq!(c.bootstrap_addrs().collect::<Vec<_>>(), vec!["127.0.0.1:4000"]);
    }

    #[test]
    fn key_parsing() {
        let key = EncryptionKey::generate();
        let mut c = NodeConfig::default();
        c.encryption_key = Some(key.to_hex());
        assert_eq!(c.encryption_key().unwrap(), Some(key));
        c.encryption_key = Some("beef".into());
        assert!(c.encryption_key().is_err());
    }
}

//! Replicating node: local store plus best-effort replication to every
//! connected peer, and a single control loop answering peers' requests.
//!
//! Files a node stores itself are kept as plaintext under the logical key.
//! Peers receive ciphertext, announced and stored under [`hash_key`] of the
//! logical key. A fetch asks every peer for the hashed key; whoever holds a
//! replica (or the original) streams sealed bytes back, and the fetching
//! node decrypts them into its own store under the logical key.
//!
//! Known limitation: a `get` running while a peer is still streaming a
//! replica on the same connection may claim that stream instead of the
//! fetch response. Callers should not fetch a key while it is being stored.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::cipher::{self, CipherError, IV_SIZE};
use crate::config::NodeConfig;
use crate::identity::{hash_key, EncryptionKey, KeyParseError, NodeId};
use crate::peer::Peer;
use crate::protocol::ControlEnvelope;
use crate::store::{ContentStore, StoreError};
use crate::transport::{
    lock, nop_handshake, version_handshake, TcpTransport, TransportError, TransportOpts,
};
use crate::wire::{self, InboundFrame, WireError, STREAM_HANDOFF};

/// How long the control loop waits for an announced stream to show up.
const STREAM_CLAIM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("broadcast failed for {failed} of {total} peers")]
    PartialBroadcast { failed: usize, total: usize },
    #[error("control loop already running")]
    AlreadyRunning,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("invalid configuration: {0}")]
    Config(#[from] KeyParseError),
}

/// Active peers by remote address. An entry exists only while its
/// connection is open and past the handshake.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: std::sync::Mutex<HashMap<String, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn insert(&self, peer: Arc<Peer>) {
        lock(&self.peers).insert(peer.addr().to_string(), peer);
    }

    pub fn remove(&self, addr: &str) -> Option<Arc<Peer>> {
        lock(&self.peers).remove(addr)
    }

    pub fn get(&self, addr: &str) -> Option<Arc<Peer>> {
        lock(&self.peers).get(addr).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        lock(&self.peers).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Node {
    config: NodeConfig,
    namespace: NodeId,
    key: EncryptionKey,
    store: ContentStore,
    transport: Arc<TcpTransport>,
    peers: Arc<PeerRegistry>,
    /// Network key -> logical key, for files this node stored itself.
    owned: std::sync::Mutex<HashMap<String, String>>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Build a node from config. A missing key or namespace is generated.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let key = match config.encryption_key()? {
            Some(k) => k,
            None => {
                warn!("no encryption key configured, generated one for this run");
                EncryptionKey::generate()
            }
        };
        let namespace = match &config.namespace {
            Some(ns) if !ns.is_empty() => NodeId::from(ns.clone()),
            _ => NodeId::generate(),
        };

        let peers = Arc::new(PeerRegistry::default());
        let mut opts = TransportOpts::new(config.listen_addr.clone());
        opts.handshake = if config.version_handshake {
            version_handshake()
        } else {
            nop_handshake()
        };
        let registry = peers.clone();
        opts.on_peer = Some(Arc::new(move |peer: Arc<Peer>| -> Result<(), TransportError> {
            info!(peer = %peer.addr(), outbound = peer.is_outbound(), "connected with remote peer");
            registry.insert(peer);
            Ok(())
        }));
        let registry = peers.clone();
        opts.on_peer_closed = Some(Arc::new(move |addr: &str| {
            registry.remove(addr);
            debug!(peer = %addr, "removed peer from registry");
        }));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            store: ContentStore::new(config.storage_root.clone()),
            transport: Arc::new(TcpTransport::new(opts)),
            config,
            namespace,
            key,
            peers,
            owned: std::sync::Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_str()
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.store
    }

    pub fn encryption_key(&self) -> &EncryptionKey {
        &self.key
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// True if `key` is held locally under its logical name.
    pub async fn has_local(&self, key: &str) -> bool {
        self.store.exists(self.namespace(), key).await
    }

    pub async fn listen(&self) -> Result<SocketAddr, NodeError> {
        Ok(self.transport.listen_and_accept().await?)
    }

    /// Dial every bootstrap address in the background. Failures are logged.
    pub fn bootstrap(&self) {
        for addr in self.config.bootstrap_addrs() {
            let addr = addr.to_string();
            let transport = self.transport.clone();
            tokio::spawn(async move {
                info!(peer = %addr, "attempting to connect with remote");
                if let Err(e) = transport.dial(&addr).await {
                    warn!(peer = %addr, error = %e, "dial error");
                }
            });
        }
    }

    /// Listen, bootstrap, then run the control loop until [`stop`](Self::stop).
    pub async fn start(&self) -> Result<(), NodeError> {
        self.listen().await?;
        self.bootstrap();
        self.run().await
    }

    /// Drain the inbound queue until shutdown. Only one loop may ever run.
    pub async fn run(&self) -> Result<(), NodeError> {
        let mut inbound = self.transport.consume().ok_or(NodeError::AlreadyRunning)?;
        let mut shutdown = self.shutdown.subscribe();
        info!(addr = %self.transport.addr(), namespace = %self.namespace, "node running");

        loop {
            let frame = tokio::select! {
                frame = inbound.recv() => frame,
                _ = stopped(&mut shutdown) => None,
            };
            match frame {
                Some(frame) => self.dispatch(frame).await,
                None => break,
            }
        }

        info!(addr = %self.transport.addr(), "node stopped");
        self.transport.close().await;
        Ok(())
    }

    /// Signal the control loop to exit and close every connection.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.transport.close().await;
    }

    /// Write `src` locally, then replicate it sealed to every peer.
    /// Returns plaintext bytes stored. Peer failures are logged only.
    pub async fn store<R>(&self, key: &str, src: &mut R) -> Result<u64, NodeError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut tee = Tee::new(src);
        let size = self.store.write(self.namespace(), key, &mut tee).await?;
        let plain = tee.into_copy();

        let network_key = hash_key(key);
        lock(&self.owned).insert(network_key.clone(), key.to_string());

        if self.peers.is_empty() {
            debug!(key = %key, "no peers to replicate to");
            return Ok(size);
        }

        let announce = ControlEnvelope::StoreFile {
            key: network_key.clone(),
            size: size + IV_SIZE as u64,
        };
        if let Err(e) = self.broadcast(wire::encode_control(&announce)?).await {
            warn!(key = %key, error = %e, "store announcement incomplete");
        }

        tokio::time::sleep(self.config.settle_delay()).await;

        let mut sealed = Vec::with_capacity(1 + IV_SIZE + plain.len());
        sealed.push(STREAM_HANDOFF);
        let n = cipher::encrypt_copy(self.key.as_bytes(), &mut &plain[..], &mut sealed).await?;
        match self.broadcast(sealed).await {
            Ok(()) => info!(key = %key, bytes = n, "replicated file to peers"),
            Err(e) => warn!(key = %key, error = %e, "replication incomplete"),
        }
        Ok(size)
    }

    /// Open `key`, fetching it from peers first if it is not held locally.
    pub async fn get(&self, key: &str) -> Result<(u64, File), NodeError> {
        let ns = self.namespace();
        if self.store.exists(ns, key).await {
            info!(key = %key, "serving file from local disk");
            return self.read_local(key).await;
        }

        let peers = self.peers.snapshot();
        if peers.is_empty() {
            return Err(NodeError::NotFound(key.to_string()));
        }

        info!(key = %key, peers = peers.len(), "don't have file locally, fetching from network");
        let request = ControlEnvelope::GetFile { key: hash_key(key) };
        if let Err(e) = self.broadcast(wire::encode_control(&request)?).await {
            warn!(key = %key, error = %e, "fetch request incomplete");
        }

        let deadline = Instant::now() + self.config.fetch_window();
        let mut supplied = false;
        for peer in peers {
            match self.fetch_from(&peer, key, deadline).await {
                Ok(Some(n)) => {
                    info!(peer = %peer.addr(), key = %key, bytes = n, "received bytes over the network");
                    supplied = true;
                }
                Ok(None) => debug!(peer = %peer.addr(), key = %key, "no response from peer"),
                Err(e) => {
                    warn!(peer = %peer.addr(), key = %key, error = %e, "fetch from peer failed");
                    peer.close().await;
                }
            }
        }

        if !supplied {
            return Err(NodeError::NotFound(key.to_string()));
        }
        self.read_local(key).await
    }

    async fn read_local(&self, key: &str) -> Result<(u64, File), NodeError> {
        match self.store.read(self.namespace(), key).await {
            Ok(found) => Ok(found),
            Err(StoreError::NotFound(k)) => Err(NodeError::NotFound(k)),
            Err(e) => Err(e.into()),
        }
    }

    /// Take over one fetch response from `peer` and decrypt it into the
    /// local store. `None` if nothing arrived before `deadline`. A response
    /// shorter than its size header leaves the store untouched.
    async fn fetch_from(
        &self,
        peer: &Peer,
        key: &str,
        deadline: Instant,
    ) -> Result<Option<u64>, NodeError> {
        let mut handle = match timeout_at(deadline, peer.begin_stream()).await {
            Ok(Some(handle)) => handle,
            Ok(None) => return Err(TransportError::Closed(peer.addr().to_string()).into()),
            Err(_) => return Ok(None),
        };
        let size = handle
            .read_size_header()
            .await
            .map_err(TransportError::from)?;
        let written = self
            .store
            .write_decrypted_exact(self.namespace(), key, self.key.as_bytes(), handle.reader(), size)
            .await;
        handle.finish();
        Ok(Some(written?))
    }

    /// Send `bytes` to every registered peer concurrently.
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<(), NodeError> {
        let bytes = Arc::new(bytes);
        let mut tasks = JoinSet::new();
        for peer in self.peers.snapshot() {
            let transport = self.transport.clone();
            let bytes = bytes.clone();
            let addr = peer.addr().to_string();
            tasks.spawn(async move {
                let sent = transport.send(&addr, &bytes).await;
                (addr, sent)
            });
        }

        let total = tasks.len();
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((addr, Err(e))) => {
                    warn!(peer = %addr, error = %e, "send to peer failed, dropping it");
                    self.peers.remove(&addr);
                    failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "send task failed");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(NodeError::PartialBroadcast { failed, total });
        }
        Ok(())
    }

    async fn dispatch(&self, frame: InboundFrame) {
        let msg = match wire::decode_envelope(&frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %frame.from, error = %e, "dropping undecodable control frame");
                return;
            }
        };
        let key = msg.key().to_string();
        debug!(peer = %frame.from, key = %key, "control message");
        let result = match msg {
            ControlEnvelope::StoreFile { key, size } => {
                self.handle_store_file(&frame.from, key, size).await
            }
            ControlEnvelope::GetFile { key } => self.handle_get_file(&frame.from, key).await,
        };
        if let Err(e) = result {
            warn!(peer = %frame.from, key = %key, error = %e, "control message failed");
        }
    }

    /// Copy exactly `size` announced bytes off the sender's connection into
    /// a replica.
    async fn handle_store_file(&self, from: &str, key: String, size: u64) -> Result<(), NodeError> {
        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| TransportError::PeerNotFound(from.to_string()))?;
        let mut handle = match timeout(STREAM_CLAIM_TIMEOUT, peer.begin_stream()).await {
            Ok(Some(handle)) => handle,
            Ok(None) => return Err(TransportError::Closed(from.to_string()).into()),
            Err(_) => {
                warn!(peer = %from, key = %key, "announced stream never arrived");
                return Ok(());
            }
        };
        let written = self
            .store
            .write_exact(self.namespace(), &key, handle.reader(), size)
            .await;
        handle.finish();

        match written {
            Ok(n) => {
                info!(addr = %self.transport.addr(), peer = %from, key = %key, bytes = n, "written bytes to disk");
                Ok(())
            }
            Err(e) => {
                peer.close().await;
                Err(e.into())
            }
        }
    }

    /// Answer a fetch with a replica verbatim, or with a freshly sealed copy
    /// of a file this node owns. Unknown keys get no answer.
    async fn handle_get_file(&self, from: &str, key: String) -> Result<(), NodeError> {
        let ns = self.namespace();
        let owned = lock(&self.owned).get(&key).cloned();
        let (size, mut file, seal) = if self.store.exists(ns, &key).await {
            let (size, file) = self.store.read(ns, &key).await?;
            (size, file, false)
        } else if let Some(logical) = owned {
            let (size, file) = self.store.read(ns, &logical).await?;
            (size + IV_SIZE as u64, file, true)
        } else {
            info!(peer = %from, key = %key, "need to serve file but it does not exist on disk");
            return Ok(());
        };

        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| TransportError::PeerNotFound(from.to_string()))?;
        if let Err(e) = self.send_file(&peer, size, &mut file, seal).await {
            peer.close().await;
            return Err(e);
        }
        info!(peer = %from, key = %key, bytes = size, "written bytes over the network");
        Ok(())
    }

    async fn send_file(&self, peer: &Peer, size: u64, file: &mut File, seal: bool) -> Result<(), NodeError> {
        let mut w = peer.lock_writer().await;
        w.write_all(&[STREAM_HANDOFF])
            .await
            .map_err(TransportError::from)?;
        w.write_all(&wire::encode_size_header(size))
            .await
            .map_err(TransportError::from)?;
        if seal {
            cipher::encrypt_copy(self.key.as_bytes(), file, &mut *w).await?;
        } else {
            tokio::io::copy(file, &mut *w)
                .await
                .map_err(TransportError::from)?;
        }
        w.flush().await.map_err(TransportError::from)?;
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.transport.addr())
            .field("namespace", &self.namespace)
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

/// Resolves once the shutdown flag is set or its sender is gone. The watch
/// guard is dropped before returning.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Reader adapter that keeps a copy of everything read through it.
struct Tee<'a, R: ?Sized> {
    inner: &'a mut R,
    copy: Vec<u8>,
}

impl<'a, R: ?Sized> Tee<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self { inner, copy: Vec::new() }
    }

    fn into_copy(self) -> Vec<u8> {
        self.copy
    }
}

impl<R: AsyncRead + Unpin + ?Sized> AsyncRead for Tee<'_, R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;
        this.copy.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

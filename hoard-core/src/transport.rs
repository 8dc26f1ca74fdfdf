//! TCP transport: accept and dial connections, run the pluggable handshake,
//! then one decode loop per connection feeding a shared inbound queue.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::peer::{ConnectionState, Peer};
use crate::protocol::PROTOCOL_VERSION;
use crate::wire::{InboundFrame, WireError};

/// Inbound queue depth shared by all connections.
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

pub type HandshakeFuture = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;
/// Runs once per new connection before it becomes active. An error drops it.
pub type HandshakeFn = Arc<dyn Fn(Arc<Peer>) -> HandshakeFuture + Send + Sync>;
/// Called once per connection that passed the handshake. An error drops it.
pub type OnPeer = Arc<dyn Fn(Arc<Peer>) -> Result<(), TransportError> + Send + Sync>;
/// Called with the remote address once an active connection is gone.
pub type OnPeerClosed = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("peer rejected: {0}")]
    Rejected(String),
    #[error("unknown peer {0}")]
    PeerNotFound(String),
    #[error("connection to {0} is closed")]
    Closed(String),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Accept every connection.
pub fn nop_handshake() -> HandshakeFn {
    Arc::new(|_peer: Arc<Peer>| -> HandshakeFuture { Box::pin(async { Ok(()) }) })
}

/// Both sides send their protocol version byte and require the other's to match.
pub fn version_handshake() -> HandshakeFn {
    Arc::new(|peer: Arc<Peer>| -> HandshakeFuture {
        Box::pin(async move { exchange_version(&peer).await })
    })
}

async fn exchange_version(peer: &Peer) -> Result<(), TransportError> {
    peer.send(&[PROTOCOL_VERSION]).await?;
    let version = peer.lock_reader().await.read_u8().await?;
    if version != PROTOCOL_VERSION {
        return Err(TransportError::Handshake(format!(
            "unsupported protocol version {version}"
        )));
    }
    Ok(())
}

pub struct TransportOpts {
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    pub on_peer: Option<OnPeer>,
    pub on_peer_closed: Option<OnPeerClosed>,
}

impl TransportOpts {
    /// No-op handshake and no callbacks.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: nop_handshake(),
            on_peer: None,
            on_peer_closed: None,
        }
    }
}

pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the transport handle and its connection tasks.
struct Shared {
    handshake: HandshakeFn,
    on_peer: Option<OnPeer>,
    on_peer_closed: Option<OnPeerClosed>,
    inbound: mpsc::Sender<InboundFrame>,
    peers: std::sync::Mutex<HashMap<String, Arc<Peer>>>,
}

impl Shared {
    async fn handle_connection(self: Arc<Self>, peer: Arc<Peer>) {
        let addr = peer.addr().to_string();

        peer.set_state(ConnectionState::Handshaking);
        if let Err(e) = (self.handshake)(peer.clone()).await {
            warn!(peer = %addr, error = %e, "handshake failed, dropping connection");
            peer.close().await;
            return;
        }

        peer.set_state(ConnectionState::Active);
        lock(&self.peers).insert(addr.clone(), peer.clone());
        if let Some(on_peer) = &self.on_peer {
            if let Err(e) = on_peer(peer.clone()) {
                warn!(peer = %addr, error = %e, "peer rejected, dropping connection");
                lock(&self.peers).remove(&addr);
                peer.close().await;
                return;
            }
        }
        info!(peer = %addr, outbound = peer.is_outbound(), "peer connected");

        match decode_loop(&peer, &self.inbound).await {
            Ok(()) => debug!(peer = %addr, "connection closed"),
            Err(e) => info!(peer = %addr, error = %e, "dropping peer connection"),
        }
        self.drop_peer(&peer).await;
    }

    async fn drop_peer(&self, peer: &Peer) {
        let removed = lock(&self.peers).remove(peer.addr()).is_some();
        peer.close().await;
        if removed {
            if let Some(on_closed) = &self.on_peer_closed {
                on_closed(peer.addr());
            }
        }
    }
}

/// Read frames until the connection fails or is closed. Control frames go
/// to `inbound`; a stream hand-off parks the loop until the bulk reader
/// that claimed it lets go.
pub(crate) async fn decode_loop(
    peer: &Peer,
    inbound: &mpsc::Sender<InboundFrame>,
) -> Result<(), TransportError> {
    loop {
        let frame = tokio::select! {
            frame = peer.read_frame() => frame?,
            _ = peer.closed() => return Ok(()),
        };
        if frame.stream {
            debug!(peer = %peer.addr(), "incoming stream, waiting");
            if !peer.gate().pause_until_resumed().await {
                return Ok(());
            }
            debug!(peer = %peer.addr(), "stream done, resuming read loop");
            continue;
        }
        if inbound.send(frame).await.is_err() {
            // Consumer is gone; nothing left to deliver to.
            return Ok(());
        }
    }
}

pub struct TcpTransport {
    listen_addr: String,
    shared: Arc<Shared>,
    inbound_rx: std::sync::Mutex<Option<mpsc::Receiver<InboundFrame>>>,
    local_addr: OnceLock<SocketAddr>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(opts: TransportOpts) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        Self {
            listen_addr: opts.listen_addr,
            shared: Arc::new(Shared {
                handshake: opts.handshake,
                on_peer: opts.on_peer,
                on_peer_closed: opts.on_peer_closed,
                inbound: tx,
                peers: std::sync::Mutex::new(HashMap::new()),
            }),
            inbound_rx: std::sync::Mutex::new(Some(rx)),
            local_addr: OnceLock::new(),
            accept_task: std::sync::Mutex::new(None),
        }
    }

    /// Bound address once listening, else the configured one.
    pub fn addr(&self) -> String {
        match self.local_addr.get() {
            Some(a) => a.to_string(),
            None => self.listen_addr.clone(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Take the inbound queue. There is one consumer; later calls get `None`.
    pub fn consume(&self) -> Option<mpsc::Receiver<InboundFrame>> {
        lock(&self.inbound_rx).take()
    }

    /// Bind the listen address and spawn the accept loop.
    pub async fn listen_and_accept(&self) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(self.listen_addr.as_str()).await?;
        let local = listener.local_addr()?;
        let _ = self.local_addr.set(local);
        let shared = self.shared.clone();
        let task = tokio::spawn(accept_loop(shared, listener));
        if let Some(old) = lock(&self.accept_task).replace(task) {
            old.abort();
        }
        info!(addr = %local, "TCP transport listening");
        Ok(local)
    }

    /// Open an outbound connection; handshake and decoding continue on a
    /// spawned task.
    pub async fn dial(&self, addr: &str) -> Result<(), TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let peer = Arc::new(Peer::from_tcp(stream, true)?);
        tokio::spawn(self.shared.clone().handle_connection(peer));
        Ok(())
    }

    /// Write `bytes` verbatim to the named peer. A failed write drops it.
    pub async fn send(&self, addr: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let peer = self
            .peer(addr)
            .ok_or_else(|| TransportError::PeerNotFound(addr.to_string()))?;
        if peer.is_closed() {
            return Err(TransportError::Closed(addr.to_string()));
        }
        if let Err(e) = peer.send(bytes).await {
            self.shared.drop_peer(&peer).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub fn peer(&self, addr: &str) -> Option<Arc<Peer>> {
        lock(&self.shared.peers).get(addr).cloned()
    }

    /// Snapshot of the active connections.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        lock(&self.shared.peers).values().cloned().collect()
    }

    /// Stop accepting and close every connection.
    pub async fn close(&self) {
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
        for peer in self.peers() {
            self.shared.drop_peer(&peer).await;
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => match Peer::from_tcp(stream, false) {
                Ok(peer) => {
                    tokio::spawn(shared.clone().handle_connection(Arc::new(peer)));
                }
                Err(e) => warn!(error = %e, "accepted connection unusable"),
            },
            Err(e) => {
                warn!(error = %e, "TCP accept error");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlEnvelope;
    use crate::wire::{self, STREAM_HANDOFF};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn loopback() -> TransportOpts {
        TransportOpts::new("127.0.0.1:0")
    }

    #[tokio::test]
    async fn decode_loop_hands_off_and_resumes_in_order() {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(local);
        let peer = Arc::new(Peer::new("mem:9", false, r, w));
        let (tx, mut rx) = mpsc::channel(8);

        let p = peer.clone();
        let task = tokio::spawn(async move { decode_loop(&p, &tx).await });

        let first = ControlEnvelope::StoreFile { key: "k".into(), size: 5 };
        let second = ControlEnvelope::GetFile { key: "next".into() };
        let mut bytes = wire::encode_control(&first).unwrap();
        bytes.push(STREAM_HANDOFF);
        bytes.extend_from_slice(b"\x01\x02raw");
        bytes.extend(wire::encode_control(&second).unwrap());
        remote.write_all(&bytes).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(wire::decode_envelope(&got.payload).unwrap(), first);

        // The raw bytes look like frames; only the claimed reader may see them.
        let mut handle = peer.begin_stream().await.unwrap();
        let mut raw = [0u8; 5];
        handle.reader().read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw, b"\x01\x02raw");
        handle.finish();

        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(!got.stream);
        assert_eq!(got.from, "mem:9");
        assert_eq!(wire::decode_envelope(&got.payload).unwrap(), second);

        peer.close().await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn decode_loop_stops_on_garbage() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(local);
        let peer = Peer::new("mem:1", false, r, w);
        let (tx, _rx) = mpsc::channel(8);
        remote.write_all(&[0xee]).await.unwrap();
        let err = decode_loop(&peer, &tx).await.unwrap_err();
        assert!(matches!(err, TransportError::Wire(WireError::UnknownFrame(0xee))));
    }

    #[tokio::test]
    async fn dial_registers_both_sides_and_delivers_frames() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut opts = loopback();
        let s = seen.clone();
        opts.on_peer = Some(Arc::new(move |peer: Arc<Peer>| -> Result<(), TransportError> {
            assert_eq!(peer.state(), ConnectionState::Active);
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let server = TcpTransport::new(opts);
        let addr = server.listen_and_accept().await.unwrap();
        let mut inbound = server.consume().unwrap();
        assert!(server.consume().is_none());

        let client = TcpTransport::new(loopback());
        client.dial(&addr.to_string()).await.unwrap();
        wait_until(|| seen.load(Ordering::SeqCst) == 1 && client.peers().len() == 1).await;

        let out = client.peers().pop().unwrap();
        assert!(out.is_outbound());
        let inb = server.peers().pop().unwrap();
        assert!(!inb.is_outbound());

        let msg = ControlEnvelope::GetFile { key: "abc".into() };
        client
            .send(out.addr(), &wire::encode_control(&msg).unwrap())
            .await
            .unwrap();
        let frame = timeout(WAIT, inbound.recv()).await.unwrap().unwrap();
        assert_eq!(wire::decode_envelope(&frame.payload).unwrap(), msg);
        assert_eq!(frame.from, inb.addr());

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn failed_handshake_never_registers() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut opts = loopback();
        opts.handshake = Arc::new(|_peer: Arc<Peer>| -> HandshakeFuture {
            Box::pin(async { Err(TransportError::Handshake("no".into())) })
        });
        let s = seen.clone();
        opts.on_peer = Some(Arc::new(move |_peer: Arc<Peer>| -> Result<(), TransportError> {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let server = TcpTransport::new(opts);
        let addr = server.listen_and_accept().await.unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        // Server hangs up without registering.
        let n = timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(server.peers().is_empty());
        server.close().await;
    }

    #[tokio::test]
    async fn rejected_by_on_peer_is_dropped() {
        let mut opts = loopback();
        opts.on_peer = Some(Arc::new(|peer: Arc<Peer>| -> Result<(), TransportError> {
            Err(TransportError::Rejected(peer.addr().to_string()))
        }));
        let server = TcpTransport::new(opts);
        let addr = server.listen_and_accept().await.unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0);
        assert!(server.peers().is_empty());
        server.close().await;
    }

    #[tokio::test]
    async fn version_handshake_accepts_match_and_rejects_mismatch() {
        let mut opts = loopback();
        opts.handshake = version_handshake();
        let server = TcpTransport::new(opts);
        let addr = server.listen_and_accept().await.unwrap();

        let mut client_opts = loopback();
        client_opts.handshake = version_handshake();
        let client = TcpTransport::new(client_opts);
        client.dial(&addr.to_string()).await.unwrap();
        wait_until(|| server.peers().len() == 1 && client.peers().len() == 1).await;

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(&[PROTOCOL_VERSION + 1]).await.unwrap();
        let mut buf = [0u8; 8];
        // Server's own version byte, then EOF.
        let mut got = Vec::new();
        loop {
            let n = timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap_or(0);
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, vec![PROTOCOL_VERSION]);
        assert_eq!(server.peers().len(), 1);

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn closed_callback_fires_when_remote_hangs_up() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut opts = loopback();
        let c = closed.clone();
        opts.on_peer_closed = Some(Arc::new(move |_addr: &str| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let server = TcpTransport::new(opts);
        let addr = server.listen_and_accept().await.unwrap();

        let client = TcpTransport::new(loopback());
        client.dial(&addr.to_string()).await.unwrap();
        wait_until(|| server.peers().len() == 1).await;

        client.close().await;
        wait_until(|| closed.load(Ordering::SeqCst) == 1).await;
        assert!(server.peers().is_empty());
        server.close().await;
    }

    #[tokio::test]
    async fn send_to_unknown_peer() {
        let t = TcpTransport::new(loopback());
        let err = t.send("10.0.0.1:1", b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::PeerNotFound(_)));
        assert_eq!(t.addr(), "127.0.0.1:0");
    }
}

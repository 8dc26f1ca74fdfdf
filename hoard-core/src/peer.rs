//! One live connection to a remote node, plus the gate that lets the decode
//! loop hand raw connection bytes over to a bulk reader and take them back.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard, Semaphore};
use tracing::warn;

use crate::wire::{self, InboundFrame, WireError};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Handshaking = 1,
    Active = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::Active,
            _ => ConnectionState::Closed,
        }
    }
}

/// Pause/resume gate. The decode loop pauses when it reads a hand-off
/// marker; exactly one bulk reader claims the hand-off and resumes it.
#[derive(Debug)]
pub struct StreamGate {
    handoff: Semaphore,
    resumed: Semaphore,
    paused: AtomicBool,
}

impl StreamGate {
    pub fn new() -> Self {
        Self {
            handoff: Semaphore::new(0),
            resumed: Semaphore::new(0),
            paused: AtomicBool::new(false),
        }
    }

    /// Publish a hand-off and block until [`resume`](Self::resume).
    /// Returns false if the gate was closed while waiting.
    pub async fn pause_until_resumed(&self) -> bool {
        self.paused.store(true, Ordering::SeqCst);
        self.handoff.add_permits(1);
        match self.resumed.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Wait for a published hand-off and claim it.
    /// Returns false if the gate was closed.
    pub async fn claim(&self) -> bool {
        match self.handoff.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Wake the paused decode loop. A resume without a matching pause is
    /// ignored and reported as false.
    pub fn resume(&self) -> bool {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.resumed.add_permits(1);
            true
        } else {
            warn!("resume without a paused decode loop");
            false
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Wake every waiter with a failure.
    pub fn close(&self) {
        self.handoff.close();
        self.resumed.close();
    }
}

impl Default for StreamGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Remote node reached over one bidirectional byte stream.
pub struct Peer {
    addr: String,
    outbound: bool,
    state: AtomicU8,
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    gate: StreamGate,
    closed: watch::Sender<bool>,
}

impl Peer {
    pub fn new<R, W>(addr: impl Into<String>, outbound: bool, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            addr: addr.into(),
            outbound,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            gate: StreamGate::new(),
            closed,
        }
    }

    /// Wrap a TCP connection; identity is the remote socket address.
    pub fn from_tcp(stream: TcpStream, outbound: bool) -> std::io::Result<Self> {
        let addr = stream.peer_addr()?;
        let (r, w) = stream.into_split();
        Ok(Self::new(addr.to_string(), outbound, r, w))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True if we dialed, false if we accepted.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn gate(&self) -> &StreamGate {
        &self.gate
    }

    /// Write `bytes` verbatim and flush.
    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(bytes).await?;
        w.flush().await
    }

    /// Exclusive access to the write half, for multi-part writes that must
    /// not interleave with other senders.
    pub async fn lock_writer(&self) -> MutexGuard<'_, BoxedWriter> {
        self.writer.lock().await
    }

    /// Exclusive access to the read half. Only valid while no decode loop is
    /// running (e.g. during a handshake).
    pub async fn lock_reader(&self) -> MutexGuard<'_, BoxedReader> {
        self.reader.lock().await
    }

    pub(crate) async fn read_frame(&self) -> Result<InboundFrame, WireError> {
        let mut r = self.reader.lock().await;
        wire::read_frame(&mut *r, &self.addr).await
    }

    /// Wait until the decode loop has paused on a hand-off, then take over
    /// the read half. Dropping the handle resumes the decode loop.
    pub async fn begin_stream(&self) -> Option<StreamHandle<'_>> {
        if !self.gate.claim().await {
            return None;
        }
        let reader = self.reader.lock().await;
        Some(StreamHandle { peer: self, reader })
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Tear the connection down: release gate waiters, stop the decode loop
    /// and shut down the write half.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.set_state(ConnectionState::Closed);
        self.gate.close();
        // A writer stuck on a full socket keeps its lock; the socket then
        // closes when the last handle to this peer is dropped.
        if let Ok(mut w) = self.writer.try_lock() {
            let _ = w.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("outbound", &self.outbound)
            .field("state", &self.state())
            .finish()
    }
}

/// Ownership of a connection's raw bytes after a hand-off. The decode loop
/// is resumed exactly once, when this is dropped.
pub struct StreamHandle<'a> {
    peer: &'a Peer,
    reader: MutexGuard<'a, BoxedReader>,
}

impl StreamHandle<'_> {
    pub fn reader(&mut self) -> &mut BoxedReader {
        &mut self.reader
    }

    pub async fn read_size_header(&mut self) -> std::io::Result<u64> {
        wire::read_size_header(&mut *self.reader).await
    }

    /// Give the connection back to the decode loop.
    pub fn finish(self) {}
}

impl Drop for StreamHandle<'_> {
    fn drop(&mut self) {
        // The decode loop re-locks the reader, so it cannot run ahead of
        // this guard's release.
        self.peer.gate.resume();
    }
}

//! Framed replication session
//!
//! A [`Session`] wraps the two halves of a byte stream and exchanges
//! [`ReplicationMessage`] frames. Closing a session cancels its token, which
//! unblocks every pending send and receive at once.
//!
//! Flow control is credit based: a sender holds a [`FlowWindow`] sized to the
//! peer's advertised window and takes one permit per `Update`. The receiver
//! counts processed updates with a [`CreditTracker`] and grants credit back
//! with `Window` messages.

use crate::protocol::{
    PROTOCOL_VERSION, ReplicationMessage, ServerStatus, StartMsg, TopologyMsg, codec,
    negotiate_version,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read half of a session transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a session transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How often a sender blocked on an exhausted window probes for credit
pub const WINDOW_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Sessions silent for this many heartbeat intervals are torn down
pub const HEARTBEAT_MISS_LIMIT: u32 = 3;

/// Session counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames written
    pub messages_sent: u64,
    /// Frames read and decoded
    pub messages_received: u64,
    /// Frames dropped because they could not be decoded
    pub decode_errors: u64,
}

/// A framed duplex replication channel
pub struct Session {
    reader: tokio::sync::Mutex<BoxedReader>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    peer: String,
    version: AtomicU8,
    cancel: CancellationToken,
    last_received: Mutex<Instant>,
    last_sent: Mutex<Instant>,
    sent: AtomicU64,
    received: AtomicU64,
    decode_errors: AtomicU64,
}

impl Session {
    /// Wrap two transport halves; `cancel` is usually a child of an owner token
    pub fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        peer: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            peer: peer.into(),
            version: AtomicU8::new(PROTOCOL_VERSION),
            cancel,
            last_received: Mutex::new(now),
            last_sent: Mutex::new(now),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }

    /// Session over a TCP connection
    pub fn from_tcp(stream: TcpStream, cancel: CancellationToken) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        Ok(Self::new(
            Box::new(read_half),
            Box::new(write_half),
            peer,
            cancel,
        ))
    }

    /// Remote address or label
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Protocol version frames are written with
    pub fn version(&self) -> u8 {
        self.version.load(Ordering::SeqCst)
    }

    /// Switch to the negotiated protocol version
    pub fn set_version(&self, version: u8) {
        self.version.store(version, Ordering::SeqCst);
    }

    /// Write one message
    pub async fn send(&self, message: &ReplicationMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Stopped);
        }
        let mut writer = self.writer.lock().await;
        let version = self.version();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Stopped),
            result = codec::write_message(&mut *writer, message, version) => result,
        };
        match result {
            Ok(()) => {
                *self.last_sent.lock() = Instant::now();
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                debug!("Send to {} failed: {}", self.peer, e);
                self.cancel.cancel();
                Err(e)
            }
        }
    }

    /// Read one message
    ///
    /// `Error::Codec` means one frame was dropped and the session is still
    /// usable; any other error closes the session.
    pub async fn recv(&self) -> Result<ReplicationMessage> {
        if self.cancel.is_cancelled() {
            return Err(Error::Stopped);
        }
        let mut reader = self.reader.lock().await;
        let frame = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Stopped),
            frame = codec::read_frame(&mut *reader) => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Receive from {} failed: {}", self.peer, e);
                self.cancel.cancel();
                return Err(e);
            }
        };
        *self.last_received.lock() = Instant::now();

        match codec::decode_versioned(&frame) {
            Ok((version, message)) => {
                if version > self.version() {
                    self.decode_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::codec(format!(
                        "Frame version {} above negotiated {}",
                        version,
                        self.version()
                    )));
                }
                self.received.fetch_add(1, Ordering::Relaxed);
                Ok(message)
            }
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Read the next message, skipping undecodable frames
    pub async fn recv_skipping_corrupt(&self) -> Result<ReplicationMessage> {
        loop {
            match self.recv().await {
                Err(Error::Codec(e)) => warn!("Dropping corrupt frame from {}: {}", self.peer, e),
                other => return other,
            }
        }
    }

    /// Close the session; pending and later calls fail with `Error::Stopped`
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Send `Stop`, shut the write half down and close
    pub async fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            let _ = tokio::time::timeout(Duration::from_millis(200), async {
                let _ = self.send(&ReplicationMessage::Stop).await;
                let mut writer = self.writer.lock().await;
                let _ = writer.shutdown().await;
            })
            .await;
        }
        self.close();
    }

    /// Whether the session was closed
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Token cancelled on close
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time since the last frame arrived
    pub fn idle_since_receive(&self) -> Duration {
        self.last_received.lock().elapsed()
    }

    /// Time since the last frame was written
    pub fn idle_since_send(&self) -> Duration {
        self.last_sent.lock().elapsed()
    }

    /// Counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Send-side credit window
#[derive(Debug)]
pub struct FlowWindow {
    permits: Semaphore,
    size: u32,
}

impl FlowWindow {
    /// Window with `size` initial credits
    pub fn new(size: u32) -> Self {
        Self {
            permits: Semaphore::new(size as usize),
            size,
        }
    }

    /// Initial window size
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Take one credit, waiting while the window is exhausted
    pub async fn acquire(&self) -> Result<()> {
        let permit = self.permits.acquire().await.map_err(|_| Error::Stopped)?;
        permit.forget();
        Ok(())
    }

    /// Take one credit without waiting
    pub fn try_acquire(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Take one credit, probing the peer while blocked
    pub async fn acquire_or_probe(&self, session: &Session, probe_interval: Duration) -> Result<()> {
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            tokio::select! {
                result = self.acquire() => return result,
                _ = session.closed() => return Err(Error::Stopped),
                _ = tokio::time::sleep(probe_interval) => {
                    debug!("Window exhausted towards {}, probing", session.peer());
                    session.send(&ReplicationMessage::WindowProbe).await?;
                }
            }
        }
    }

    /// Add `credits` granted by the peer
    pub fn release(&self, credits: u32) {
        self.permits.add_permits(credits as usize);
    }

    /// Credits currently available
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Fail every current and future acquire
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Receive-side credit accounting
#[derive(Debug)]
pub struct CreditTracker {
    threshold: u32,
    pending: AtomicU32,
}

impl CreditTracker {
    /// Tracker for a receive window of `window` updates
    pub fn new(window: u32) -> Self {
        Self {
            threshold: (window / 2).max(1),
            pending: AtomicU32::new(0),
        }
    }

    /// Count one processed update; returns the credit to grant, if due
    pub fn processed(&self) -> Option<u32> {
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if pending >= self.threshold {
            self.take()
        } else {
            None
        }
    }

    /// Take all pending credit (answer to a probe)
    pub fn take(&self) -> Option<u32> {
        match self.pending.swap(0, Ordering::SeqCst) {
            0 => None,
            credits => Some(credits),
        }
    }
}

/// What the initiator learns from a handshake
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Peer's `Start`
    pub remote: StartMsg,
    /// Topology sent by the relay once the session started
    pub topology: TopologyMsg,
    /// Negotiated protocol version
    pub version: u8,
}

/// Initiator side: `Start` -> `Start` -> `StartSession` -> `Topology`
pub async fn initiate_handshake(
    session: &Session,
    local: StartMsg,
    status: ServerStatus,
) -> Result<HandshakeOutcome> {
    let group_id = local.group_id;
    let base_dn = local.base_dn.clone();
    session.send(&ReplicationMessage::Start(local.clone())).await?;

    let remote = match session.recv().await? {
        ReplicationMessage::Start(remote) => remote,
        ReplicationMessage::Error { details, .. } => {
            return Err(Error::protocol(format!("Handshake refused: {}", details)));
        }
        other => {
            return Err(Error::protocol(format!(
                "Expected Start, got {:?}",
                other.message_type()
            )));
        }
    };
    if remote.base_dn != base_dn {
        return Err(Error::protocol(format!(
            "Peer answered for domain {} instead of {}",
            remote.base_dn, base_dn
        )));
    }
    let version = negotiate_version(local.protocol_version, remote.protocol_version)?;
    session.set_version(version);

    session
        .send(&ReplicationMessage::StartSession { status, group_id })
        .await?;

    loop {
        match session.recv().await? {
            ReplicationMessage::Topology(topology) => {
                return Ok(HandshakeOutcome {
                    remote,
                    topology,
                    version,
                });
            }
            ReplicationMessage::Heartbeat { .. } => continue,
            ReplicationMessage::Error { details, .. } => {
                return Err(Error::protocol(format!("Handshake refused: {}", details)));
            }
            other => {
                return Err(Error::protocol(format!(
                    "Expected Topology, got {:?}",
                    other.message_type()
                )));
            }
        }
    }
}

/// Send heartbeats on an idle timer and close sessions that went silent
pub fn spawn_heartbeat_monitor(session: Arc<Session>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tick = (interval / 2).max(Duration::from_millis(10));
        let dead_after = interval * HEARTBEAT_MISS_LIMIT;
        loop {
            tokio::select! {
                _ = session.closed() => break,
                _ = tokio::time::sleep(tick) => {}
            }
            if session.idle_since_receive() >= dead_after {
                warn!(
                    "No traffic from {} for {:?}, closing session",
                    session.peer(),
                    session.idle_since_receive()
                );
                session.close();
                break;
            }
            if session.idle_since_send() >= interval {
                let heartbeat = ReplicationMessage::Heartbeat {
                    timestamp_ms: crate::csn::current_time_ms(),
                };
                if session.send(&heartbeat).await.is_err() {
                    break;
                }
            }
        }
    })
}

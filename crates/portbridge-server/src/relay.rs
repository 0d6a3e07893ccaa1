//! Relay link: pairs one inbound and one outbound TCP connection and
//! forwards bytes both ways until either side closes.
//!
//! The link is a forward-only state machine (Pending → Active → Closed,
//! see [`LinkState`]). Forwarding happens exclusively while Active; every
//! terminal event sets Closed before the loop exits, so no write can race
//! a teardown. Chunks are written unmodified, in arrival order, with no
//! buffering beyond the transport's own write buffer.
//!
//! The idle timer is one-shot: it is armed when the link becomes Active
//! and deliberately does NOT reset on traffic. When it fires, the inbound
//! side is closed and teardown follows the ordinary end-of-stream path.

use portbridge_core::{LinkState, SessionId};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Read chunk size, per direction.
const CHUNK: usize = 8192;

/// Why a relay ended.
#[derive(Debug)]
pub enum RelayOutcome {
    /// End-of-stream from the inbound peer.
    ClosedByPeer,
    /// End-of-stream from the backend.
    ClosedByBackend,
    /// The one-shot idle timer fired.
    IdleTimeout,
    /// The inbound peer reset the connection. Ordinary disconnect, not an
    /// error.
    PeerReset,
    /// Unexpected failure on the inbound side.
    InboundError(io::Error),
    /// Unexpected failure on the outbound (backend) side.
    BackendError(io::Error),
}

/// Final accounting for a finished link.
#[derive(Debug)]
pub struct LinkReport {
    /// Bytes received from the inbound peer and forwarded to the backend.
    pub bytes_rx: u64,
    /// Bytes received from the backend and forwarded to the peer.
    pub bytes_tx: u64,
    pub outcome: RelayOutcome,
}

/// One proxied connection pairing an inbound peer with a backend.
pub struct RelayLink {
    id: SessionId,
    peer: SocketAddr,
    target: SocketAddr,
    state: LinkState,
    bytes_rx: u64,
    bytes_tx: u64,
}

impl RelayLink {
    /// A link starts Pending; it becomes Active once the caller hands it
    /// the established outbound connection via [`RelayLink::run`].
    pub fn new(id: SessionId, peer: SocketAddr, target: SocketAddr) -> Self {
        Self {
            id,
            peer,
            target,
            state: LinkState::Pending,
            bytes_rx: 0,
            bytes_tx: 0,
        }
    }

    /// Initiate the outbound connect for a new link, bounded by
    /// `connect_timeout`. An elapsed timeout surfaces as
    /// [`io::ErrorKind::TimedOut`] so callers can apply the
    /// restart-trigger policy uniformly.
    pub async fn connect(target: SocketAddr, connect_timeout: Duration) -> io::Result<TcpStream> {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "outbound connect timed out",
            )),
        }
    }

    /// Forward bytes between `inbound` and `outbound` until a terminal
    /// event, then close both sides and return the final accounting.
    ///
    /// `drain_rx` is the graceful-shutdown signal: on receipt the outbound
    /// side is half-closed and the link ends through the normal
    /// end-of-stream path once the backend closes in turn.
    pub async fn run(
        mut self,
        inbound: TcpStream,
        outbound: TcpStream,
        idle_timeout: Duration,
        mut drain_rx: mpsc::Receiver<()>,
    ) -> LinkReport {
        self.state = LinkState::Active;
        debug!(session = %self.id, peer = %self.peer, target = %self.target, "relay active");

        let (mut in_read, mut in_write) = inbound.into_split();
        let (mut out_read, mut out_write) = outbound.into_split();
        let mut in_buf = vec![0u8; CHUNK];
        let mut out_buf = vec![0u8; CHUNK];
        let mut draining = false;

        // One-shot: armed at establishment, never rearmed.
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        let outcome = loop {
            tokio::select! {
                _ = &mut idle => {
                    info!(session = %self.id, "session idle timeout");
                    let _ = in_write.shutdown().await;
                    break RelayOutcome::IdleTimeout;
                }
                signal = drain_rx.recv(), if !draining => {
                    draining = true;
                    if signal.is_some() {
                        debug!(session = %self.id, "drain requested, ending outbound side");
                        let _ = out_write.shutdown().await;
                    }
                }
                result = in_read.read(&mut in_buf) => match result {
                    Ok(0) => {
                        let _ = out_write.shutdown().await;
                        break RelayOutcome::ClosedByPeer;
                    }
                    Ok(n) => {
                        self.bytes_rx += n as u64;
                        if let Err(e) = out_write.write_all(&in_buf[..n]).await {
                            break RelayOutcome::BackendError(e);
                        }
                    }
                    Err(e) if is_reset(&e) => break RelayOutcome::PeerReset,
                    Err(e) => break RelayOutcome::InboundError(e),
                },
                result = out_read.read(&mut out_buf) => match result {
                    Ok(0) => {
                        let _ = in_write.shutdown().await;
                        break RelayOutcome::ClosedByBackend;
                    }
                    Ok(n) => {
                        self.bytes_tx += n as u64;
                        if let Err(e) = in_write.write_all(&out_buf[..n]).await {
                            if is_reset(&e) {
                                break RelayOutcome::PeerReset;
                            }
                            break RelayOutcome::InboundError(e);
                        }
                    }
                    Err(e) => break RelayOutcome::BackendError(e),
                },
            }
        };

        // Terminal. Force-close whichever side is still open; errors here
        // only mean the side was already gone.
        self.state = LinkState::Closed;
        let _ = in_write.shutdown().await;
        let _ = out_write.shutdown().await;

        LinkReport {
            bytes_rx: self.bytes_rx,
            bytes_tx: self.bytes_tx,
            outcome,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }
}

/// Peer resets are expected transport closures, not exceptions.
fn is_reset(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionReset
}

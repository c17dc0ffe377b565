//! Transport abstraction for peer links
//!
//! A transport hands out [`Link`]s: an ordered, reliable pair of frame
//! channels to one remote peer. The connection manager only ever sees
//! links, so the handshake and dispatch logic is identical for the iroh
//! QUIC transport and the in-process [`MemoryNetwork`] used by tests.
//!
//! ```text
//! ┌──────────────┐  outbound: mpsc::Sender<Bytes>   ┌──────────────┐
//! │  local side  │ ───────────────────────────────> │ remote side  │
//! │    Link      │ <─────────────────────────────── │    Link      │
//! └──────────────┘  inbound: mpsc::Receiver<Bytes>  └──────────────┘
//! ```
//!
//! Dropping the outbound sender closes the link; the remote observes the
//! close as its inbound receiver returning `None`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::types::PeerId;

/// Frames buffered per link direction before sends start failing
pub const LINK_BUFFER: usize = 256;

/// Largest frame a transport carries unless it says otherwise
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Which side opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote peer dialed us
    Inbound,
    /// We dialed the remote peer
    Outbound,
}

/// One open link to a remote peer
#[derive(Debug)]
pub struct Link {
    /// Transport-level ID of the remote peer
    pub peer: PeerId,
    /// Who opened the link
    pub direction: Direction,
    /// Frames to the remote peer
    pub outbound: mpsc::Sender<Bytes>,
    /// Frames from the remote peer
    pub inbound: mpsc::Receiver<Bytes>,
}

impl Link {
    /// Build both ends of a link between `dialer` and `listener`.
    ///
    /// Returns `(dialer_end, listener_end)`.
    pub fn pair(dialer: PeerId, listener: PeerId) -> (Link, Link) {
        let (to_listener, from_dialer) = mpsc::channel(LINK_BUFFER);
        let (to_dialer, from_listener) = mpsc::channel(LINK_BUFFER);

        let dialer_end = Link {
            peer: listener,
            direction: Direction::Outbound,
            outbound: to_listener,
            inbound: from_listener,
        };
        let listener_end = Link {
            peer: dialer,
            direction: Direction::Inbound,
            outbound: to_dialer,
            inbound: from_dialer,
        };
        (dialer_end, listener_end)
    }
}

/// Peer-connection primitive the core runs on
pub trait Transport: Send + Sync + 'static {
    /// Our own transport-level ID
    fn local_id(&self) -> PeerId;

    /// Open a link to `remote`
    fn connect(&self, remote: &PeerId) -> impl Future<Output = SyncResult<Link>> + Send;

    /// Wait for the next inbound link; `None` once the transport shuts down
    fn accept(&self) -> impl Future<Output = Option<Link>> + Send;

    /// Largest frame the link can carry; bigger frames must not be sent
    fn max_frame_length(&self) -> usize {
        MAX_FRAME_LENGTH
    }
}

/// In-process hub connecting [`MemoryTransport`]s by name
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<PeerId, mpsc::Sender<Link>>>>,
    max_frame_length: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty network whose transports report a smaller frame limit
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            listeners: Arc::default(),
            max_frame_length,
        }
    }

    /// Register a transport under `id`, replacing any previous one
    pub fn transport(&self, id: impl Into<PeerId>) -> MemoryTransport {
        let id = id.into();
        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        self.listeners.lock().insert(id.clone(), tx);
        MemoryTransport {
            id,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
        }
    }

    /// Remove `id` so further dials to it fail
    pub fn unregister(&self, id: &PeerId) {
        self.listeners.lock().remove(id);
    }

    /// Open a raw link from `from` to the transport registered as `to`.
    ///
    /// Tests use this to play a misbehaving peer by hand.
    pub async fn dial(&self, from: &PeerId, to: &PeerId) -> SyncResult<Link> {
        let listener = self
            .listeners
            .lock()
            .get(to)
            .cloned()
            .ok_or_else(|| SyncError::Transport(format!("No listener at {}", to)))?;

        let (dialer_end, listener_end) = Link::pair(from.clone(), to.clone());
        listener
            .send(listener_end)
            .await
            .map_err(|_| SyncError::Transport(format!("Listener at {} is gone", to)))?;

        debug!(from = %from, to = %to, "Memory link opened");
        Ok(dialer_end)
    }
}

/// Transport endpoint on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    id: PeerId,
    network: MemoryNetwork,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Link>>,
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn connect(&self, remote: &PeerId) -> SyncResult<Link> {
        self.network.dial(&self.id, remote).await
    }

    async fn accept(&self) -> Option<Link> {
        self.incoming.lock().await.recv().await
    }

    fn max_frame_length(&self) -> usize {
        self.network.max_frame_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_pair_carries_frames_both_ways() {
        let (mut a, mut b) = Link::pair(PeerId::new("a"), PeerId::new("b"));
        assert_eq!(a.peer, PeerId::new("b"));
        assert_eq!(b.peer, PeerId::new("a"));
        assert_eq!(a.direction, Direction::Outbound);
        assert_eq!(b.direction, Direction::Inbound);

        a.outbound.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.inbound.recv().await.unwrap(), Bytes::from_static(b"ping"));

        b.outbound.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(a.inbound.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_dropping_sender_closes_link() {
        let (a, mut b) = Link::pair(PeerId::new("a"), PeerId::new("b"));
        drop(a);
        assert!(b.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_connect_and_accept() {
        let network = MemoryNetwork::new();
        let alice = network.transport("alice");
        let bob = network.transport("bob");

        let mut outgoing = alice.connect(&PeerId::new("bob")).await.unwrap();
        let mut incoming = bob.accept().await.unwrap();

        assert_eq!(incoming.peer, PeerId::new("alice"));
        outgoing.outbound.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(incoming.inbound.recv().await.unwrap(), Bytes::from_static(b"hi"));

        incoming.outbound.send(Bytes::from_static(b"yo")).await.unwrap();
        assert_eq!(outgoing.inbound.recv().await.unwrap(), Bytes::from_static(b"yo"));
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let alice = network.transport("alice");

        let result = alice.connect(&PeerId::new("nobody")).await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
    }
}

//! Authenticated peer connections
//!
//! The `ConnectionManager` owns every transport link, runs the
//! challenge/response handshake on each one and keeps the registry of
//! authenticated peers. It is the only owner of that registry; callers go
//! through its methods and never see the map itself.
//!
//! ## Handshake
//!
//! Both ends of a link play both roles independently:
//!
//! ```text
//! on open:            send AuthChallenge{nonce}, start timer
//! AuthChallenge{n}:   reply AuthResponse{sign(n), our key}
//! AuthResponse{s,k}:  verify(nonce, s, k) && trusted(k) → Authenticated
//! anything else:      authentication failure → Closed
//! timer expires:      Closed
//! ```
//!
//! Once authenticated, `SyncRequest`, `SyncResponse` and `NoteUpdate`
//! frames are forwarded to the coordinator inbox in link order. Unknown or
//! undecodable frames are logged and dropped without closing the link.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ConnectionManager                                              │
//! │  ├── registry.peers: HashMap<PeerId, PeerConnection>            │
//! │  │   └── authenticated links, one per peer                      │
//! │  ├── registry.pending: HashMap<conn_id, PendingLink>            │
//! │  │   └── links still in the handshake                           │
//! │  ├── inbox: mpsc::Sender<InboundMessage> → coordinator          │
//! │  └── events: broadcast::Sender<SyncEvent>                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use parking_lot::RwLock;
use rand::RngCore;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ConnectionState, SyncEvent};
use super::protocol::{decode_base64, Inbound, ProtocolMessage, NONCE_SIZE};
use super::transport::{Direction, Link, Transport};
use crate::error::{AuthFailure, SyncError, SyncResult};
use crate::identity::TrustStore;
use crate::types::{PeerId, PeerIdentity};

/// How long a peer has to answer our challenge
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Messages queued for the coordinator before link readers wait
const INBOX_CAPACITY: usize = 1024;

/// A sync message from an authenticated peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Authenticated sender
    pub from: PeerId,
    /// `SyncRequest`, `SyncResponse` or `NoteUpdate`
    pub message: ProtocolMessage,
}

/// Outcome of a broadcast: one attempt per authenticated peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Every peer a transmit was attempted to
    pub attempted: Vec<PeerId>,
    /// Peers whose transmit failed
    pub failed: Vec<PeerId>,
}

impl BroadcastReport {
    /// Number of successful transmits
    pub fn delivered(&self) -> usize {
        self.attempted.len() - self.failed.len()
    }
}

struct PeerConnection {
    conn_id: u64,
    /// Peer that opened the link; used to pick a winner between duplicate links
    dialer: PeerId,
    public_key: String,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

struct PendingLink {
    peer: PeerId,
    state: ConnectionState,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    peers: HashMap<PeerId, PeerConnection>,
    pending: HashMap<u64, PendingLink>,
}

struct ManagerInner<T> {
    transport: T,
    local_id: PeerId,
    trust: Arc<TrustStore>,
    registry: RwLock<Registry>,
    inbox: mpsc::Sender<InboundMessage>,
    events: broadcast::Sender<SyncEvent>,
    auth_timeout: Duration,
    max_frame_length: usize,
    next_conn_id: AtomicU64,
}

/// Owner of all peer links and their handshake state
///
/// Cloning is cheap; clones share the same registry.
pub struct ConnectionManager<T: Transport> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager over `transport`.
    ///
    /// Returns the manager and the receiving end of the coordinator inbox.
    pub fn new(
        transport: T,
        trust: Arc<TrustStore>,
        auth_timeout: Duration,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbox, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let local_id = transport.local_id();
        let max_frame_length = transport.max_frame_length();

        let manager = Self {
            inner: Arc::new(ManagerInner {
                transport,
                local_id,
                trust,
                registry: RwLock::new(Registry::default()),
                inbox,
                events,
                auth_timeout,
                max_frame_length,
                next_conn_id: AtomicU64::new(1),
            }),
        };
        (manager, inbox_rx)
    }

    /// Our transport-level ID
    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Largest encoded message a link accepts
    pub fn max_frame_length(&self) -> usize {
        self.inner.max_frame_length
    }

    /// The trust store used to verify peers
    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.inner.trust
    }

    /// Subscribe to connection and sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Accept inbound links until the transport shuts down
    pub fn listen(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            info!(local = %manager.local_id(), "Listening for peer links");
            while let Some(link) = manager.inner.transport.accept().await {
                debug!(peer = %link.peer, "Inbound link opened");
                manager.handle_link(link);
            }
            debug!("Transport stopped accepting links");
        })
    }

    /// Dial `peer` and start the handshake.
    ///
    /// Returns `Ok(false)` without dialing when the peer is already
    /// authenticated or a handshake with it is in progress.
    pub async fn connect_to_peer(&self, peer: &PeerId) -> SyncResult<bool> {
        let conn_id = self.next_conn_id();
        let cancel = CancellationToken::new();
        {
            let mut registry = self.inner.registry.write();
            let busy = registry.peers.contains_key(peer)
                || registry.pending.values().any(|p| &p.peer == peer);
            if busy {
                debug!(peer = %peer, "Already connected or connecting");
                return Ok(false);
            }
            registry.pending.insert(
                conn_id,
                PendingLink {
                    peer: peer.clone(),
                    state: ConnectionState::Connecting,
                    cancel: cancel.clone(),
                },
            );
        }

        debug!(peer = %peer, "Dialing peer");
        match self.inner.transport.connect(peer).await {
            Ok(link) => {
                self.spawn_link(link, conn_id, cancel);
                Ok(true)
            }
            Err(e) => {
                self.inner.registry.write().pending.remove(&conn_id);
                warn!(peer = %peer, error = %e, "Failed to connect to peer");
                Err(e)
            }
        }
    }

    /// Run the handshake and message loop for a link opened elsewhere
    pub fn handle_link(&self, link: Link) -> JoinHandle<()> {
        self.spawn_link(link, self.next_conn_id(), CancellationToken::new())
    }

    /// Send one message to an authenticated peer
    pub fn send_to_peer(&self, peer: &PeerId, message: &ProtocolMessage) -> SyncResult<()> {
        let frame = message.encode()?;
        let outbound = self
            .inner
            .registry
            .read()
            .peers
            .get(peer)
            .map(|conn| conn.outbound.clone())
            .ok_or_else(|| SyncError::NotConnected(peer.clone()))?;

        self.send_frame(&outbound, frame)?;
        debug!(peer = %peer, kind = message.kind(), "Sent message");
        Ok(())
    }

    /// Send one message to every authenticated peer, one attempt each
    pub fn broadcast_to_peers(&self, message: &ProtocolMessage) -> SyncResult<BroadcastReport> {
        let frame = message.encode()?;
        let targets: Vec<(PeerId, mpsc::Sender<Bytes>)> = self
            .inner
            .registry
            .read()
            .peers
            .iter()
            .map(|(peer, conn)| (peer.clone(), conn.outbound.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        for (peer, outbound) in targets {
            if let Err(e) = self.send_frame(&outbound, frame.clone()) {
                warn!(peer = %peer, error = %e, "Broadcast transmit failed");
                report.failed.push(peer.clone());
            }
            report.attempted.push(peer);
        }

        debug!(
            kind = message.kind(),
            attempted = report.attempted.len(),
            failed = report.failed.len(),
            "Broadcast message"
        );
        Ok(report)
    }

    /// Close every link to `peer`, including one still in the handshake.
    ///
    /// Returns `true` if an authenticated link was closed.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let removed = {
            let mut registry = self.inner.registry.write();
            for pending in registry.pending.values().filter(|p| &p.peer == peer) {
                pending.cancel.cancel();
            }
            registry.peers.remove(peer)
        };

        match removed {
            Some(conn) => {
                conn.cancel.cancel();
                info!(peer = %peer, "Disconnected peer");
                self.emit(SyncEvent::PeerDisconnected { peer: peer.clone() });
                true
            }
            None => false,
        }
    }

    /// Close every link
    pub fn shutdown(&self) {
        let registry = self.inner.registry.read();
        for conn in registry.peers.values() {
            conn.cancel.cancel();
        }
        for pending in registry.pending.values() {
            pending.cancel.cancel();
        }
        info!(peers = registry.peers.len(), "Closing all peer links");
    }

    /// Current state of the link to `peer`
    pub fn connection_state(&self, peer: &PeerId) -> ConnectionState {
        let registry = self.inner.registry.read();
        if registry.peers.contains_key(peer) {
            return ConnectionState::Authenticated;
        }
        let pending: Vec<ConnectionState> = registry
            .pending
            .values()
            .filter(|p| &p.peer == peer)
            .map(|p| p.state)
            .collect();
        if pending.contains(&ConnectionState::AwaitingResponse) {
            ConnectionState::AwaitingResponse
        } else if pending.contains(&ConnectionState::Connecting) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Closed
        }
    }

    /// All authenticated peers, sorted
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.registry.read().peers.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Address and proven key of an authenticated peer
    pub fn peer_identity(&self, peer: &PeerId) -> Option<PeerIdentity> {
        self.inner
            .registry
            .read()
            .peers
            .get(peer)
            .map(|conn| PeerIdentity {
                peer_id: peer.clone(),
                public_key: conn.public_key.clone(),
            })
    }

    /// Periodically redial any of `peers` without a live link
    pub fn maintain_connections(&self, peers: Vec<PeerId>, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for peer in &peers {
                    if peer == manager.local_id() {
                        continue;
                    }
                    if manager.connection_state(peer) != ConnectionState::Closed {
                        continue;
                    }
                    if let Err(e) = manager.connect_to_peer(peer).await {
                        debug!(peer = %peer, error = %e, "Reconnect attempt failed");
                    }
                }
            }
        })
    }

    fn next_conn_id(&self) -> u64 {
        self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn_link(&self, link: Link, conn_id: u64, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.drive_link(link, conn_id, cancel).await })
    }

    /// Handshake, then pump authenticated frames until the link closes
    async fn drive_link(self, link: Link, conn_id: u64, cancel: CancellationToken) {
        let Link {
            peer,
            direction,
            outbound,
            mut inbound,
        } = link;
        let dialer = match direction {
            Direction::Outbound => self.local_id().clone(),
            Direction::Inbound => peer.clone(),
        };

        self.inner.registry.write().pending.insert(
            conn_id,
            PendingLink {
                peer: peer.clone(),
                state: ConnectionState::AwaitingResponse,
                cancel: cancel.clone(),
            },
        );

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);

        let outcome = match ProtocolMessage::challenge(&nonce)
            .encode()
            .and_then(|frame| self.send_frame(&outbound, frame))
        {
            Err(_) => Err(AuthFailure::LinkClosed),
            Ok(()) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(AuthFailure::LinkClosed),
                    result = tokio::time::timeout(
                        self.inner.auth_timeout,
                        self.handshake(&peer, &nonce, &outbound, &mut inbound),
                    ) => result.unwrap_or(Err(AuthFailure::Timeout)),
                }
            }
        };

        let public_key = match outcome {
            Ok(public_key) => public_key,
            Err(reason) => {
                self.inner.registry.write().pending.remove(&conn_id);
                warn!(peer = %peer, %reason, "Authentication failed, closing link");
                self.emit(SyncEvent::AuthenticationFailed {
                    peer: peer.clone(),
                    reason,
                });
                return;
            }
        };

        if !self.register(conn_id, &peer, dialer, &public_key, &outbound, &cancel) {
            debug!(peer = %peer, "Duplicate link dropped in favour of existing one");
            return;
        }

        info!(peer = %peer, public_key = %public_key, "Peer authenticated");
        self.emit(SyncEvent::PeerAuthenticated {
            peer: peer.clone(),
            public_key,
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => self.dispatch(&peer, &outbound, &frame).await,
                    None => break,
                },
            }
        }

        if self.deregister(conn_id, &peer) {
            info!(peer = %peer, "Peer disconnected");
            self.emit(SyncEvent::PeerDisconnected { peer });
        }
    }

    /// Read frames until the peer answers our challenge.
    ///
    /// Returns the peer's public key in canonical base64.
    async fn handshake(
        &self,
        peer: &PeerId,
        nonce: &[u8],
        outbound: &mpsc::Sender<Bytes>,
        inbound: &mut mpsc::Receiver<Bytes>,
    ) -> Result<String, AuthFailure> {
        loop {
            let frame = inbound.recv().await.ok_or(AuthFailure::LinkClosed)?;
            let message = match ProtocolMessage::decode(&frame) {
                Ok(Inbound::Message(message)) => message,
                Ok(Inbound::Unknown(kind)) => {
                    debug!(peer = %peer, kind, "Unknown message before authentication");
                    return Err(AuthFailure::UnexpectedMessage);
                }
                Err(_) => return Err(AuthFailure::Malformed),
            };

            match message {
                ProtocolMessage::AuthChallenge { nonce: theirs } => {
                    match self.answer_challenge(outbound, &theirs) {
                        Ok(()) => debug!(peer = %peer, "Answered challenge"),
                        Err(SyncError::Serialization(_)) => return Err(AuthFailure::Malformed),
                        Err(_) => return Err(AuthFailure::LinkClosed),
                    }
                }
                ProtocolMessage::AuthResponse {
                    signature,
                    public_key,
                } => return self.check_response(nonce, &signature, &public_key),
                other => {
                    debug!(peer = %peer, kind = other.kind(), "Message before authentication");
                    return Err(AuthFailure::UnexpectedMessage);
                }
            }
        }
    }

    fn check_response(
        &self,
        nonce: &[u8],
        signature: &str,
        public_key: &str,
    ) -> Result<String, AuthFailure> {
        let signature = decode_base64(signature).map_err(|_| AuthFailure::Malformed)?;
        let key = decode_base64(public_key).map_err(|_| AuthFailure::Malformed)?;

        if !self.inner.trust.verify(nonce, &signature, &key) {
            return Err(AuthFailure::BadSignature);
        }
        let key = STANDARD.encode(key);
        if !self.inner.trust.is_trusted(&key) {
            return Err(AuthFailure::UntrustedKey);
        }
        Ok(key)
    }

    fn answer_challenge(&self, outbound: &mpsc::Sender<Bytes>, nonce: &str) -> SyncResult<()> {
        let nonce = decode_base64(nonce)?;
        let signature = self.inner.trust.sign(&nonce);
        let response = ProtocolMessage::response(&signature, self.inner.trust.public_key_base64());
        self.send_frame(outbound, response.encode()?)
    }

    /// Move a link from pending to the peer registry.
    ///
    /// When the peer already has a link, the one dialed by the smaller peer
    /// ID wins so both ends keep the same link; a redial by the same side
    /// replaces the old link.
    fn register(
        &self,
        conn_id: u64,
        peer: &PeerId,
        dialer: PeerId,
        public_key: &str,
        outbound: &mpsc::Sender<Bytes>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut registry = self.inner.registry.write();
        registry.pending.remove(&conn_id);
        if cancel.is_cancelled() {
            return false;
        }

        if let Some(existing) = registry.peers.get(peer) {
            let preferred = std::cmp::min(self.local_id(), peer);
            let replace = existing.dialer == dialer || &dialer == preferred;
            if !replace {
                return false;
            }
            existing.cancel.cancel();
        }

        registry.peers.insert(
            peer.clone(),
            PeerConnection {
                conn_id,
                dialer,
                public_key: public_key.to_string(),
                outbound: outbound.clone(),
                cancel: cancel.clone(),
            },
        );
        true
    }

    /// Remove `peer` if its registered link is still `conn_id`
    fn deregister(&self, conn_id: u64, peer: &PeerId) -> bool {
        let mut registry = self.inner.registry.write();
        match registry.peers.get(peer) {
            Some(conn) if conn.conn_id == conn_id => {
                registry.peers.remove(peer);
                true
            }
            _ => false,
        }
    }

    async fn dispatch(&self, peer: &PeerId, outbound: &mpsc::Sender<Bytes>, frame: &[u8]) {
        let message = match ProtocolMessage::decode(frame) {
            Ok(Inbound::Message(message)) => message,
            Ok(Inbound::Unknown(kind)) => {
                warn!(peer = %peer, kind, "Dropping message of unknown type");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping malformed frame");
                return;
            }
        };

        match message {
            ProtocolMessage::AuthChallenge { nonce } => {
                if let Err(e) = self.answer_challenge(outbound, &nonce) {
                    warn!(peer = %peer, error = %e, "Failed to answer challenge");
                }
            }
            ProtocolMessage::AuthResponse { .. } => {
                debug!(peer = %peer, "Ignoring AuthResponse on authenticated link");
            }
            message => {
                debug!(peer = %peer, kind = message.kind(), "Received message");
                let inbound = InboundMessage {
                    from: peer.clone(),
                    message,
                };
                if self.inner.inbox.send(inbound).await.is_err() {
                    debug!(peer = %peer, "Coordinator inbox closed, dropping message");
                }
            }
        }
    }

    /// Queue a frame without waiting; oversized frames never reach the link
    fn send_frame(&self, outbound: &mpsc::Sender<Bytes>, frame: Bytes) -> SyncResult<()> {
        let limit = self.inner.max_frame_length;
        if frame.len() > limit {
            return Err(SyncError::Transport(format!(
                "Frame of {} bytes exceeds the {} byte limit",
                frame.len(),
                limit
            )));
        }
        outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SyncError::Transport("Send buffer full".into()),
            mpsc::error::TrySendError::Closed(_) => SyncError::Transport("Link closed".into()),
        })
    }
}

//! QUIC transport over iroh
//!
//! Each link is one iroh connection on the [`SYNC_ALPN`] protocol carrying a
//! single bidirectional stream. Frames on the stream are length-delimited
//! (tokio-util codec). Peer IDs are iroh endpoint IDs in their string form.
//!
//! ```text
//! Link.outbound ──> writer task ──FramedWrite──> SendStream ──> remote
//! Link.inbound  <── reader task <──FramedRead─── RecvStream <── remote
//! ```
//!
//! The writer closes the connection once the link's sender is dropped, and
//! the reader drops the inbound sender when the remote goes away.

use std::net::SocketAddr;
use std::path::Path;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, RelayUrl, SecretKey};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::transport::{Direction, Link, Transport, LINK_BUFFER, MAX_FRAME_LENGTH};
use crate::error::{SyncError, SyncResult};
use crate::identity::write_private_file;
use crate::types::PeerId;

/// ALPN identifier for the sync protocol
pub const SYNC_ALPN: &[u8] = b"/hivemind/sync/1";

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Spawn the reader and writer tasks for one stream and return its link
fn bridge(
    conn: Connection,
    send: SendStream,
    recv: RecvStream,
    peer: PeerId,
    direction: Direction,
) -> Link {
    let (outbound, mut to_remote) = mpsc::channel::<Bytes>(LINK_BUFFER);
    let (from_remote, inbound) = mpsc::channel::<Bytes>(LINK_BUFFER);

    let writer_conn = conn.clone();
    let writer_peer = peer.clone();
    tokio::spawn(async move {
        let mut writer = FramedWrite::new(send, codec());
        while let Some(frame) = to_remote.recv().await {
            if let Err(e) = writer.send(frame).await {
                debug!(peer = %writer_peer, error = %e, "Stream write failed");
                break;
            }
        }
        let mut send = writer.into_inner();
        let _ = send.finish();
        writer_conn.close(0u32.into(), b"link closed");
        debug!(peer = %writer_peer, "Closed link");
    });

    let reader_peer = peer.clone();
    tokio::spawn(async move {
        let mut reader = FramedRead::new(recv, codec());
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(frame) => {
                    if from_remote.send(frame.freeze()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(peer = %reader_peer, error = %e, "Stream read ended");
                    break;
                }
            }
        }
        // the connection stays open for as long as the remote keeps talking
        drop(conn);
    });

    Link {
        peer,
        direction,
        outbound,
        inbound,
    }
}

/// Router handler forwarding accepted connections as inbound links
#[derive(Clone)]
struct LinkAcceptor {
    links: mpsc::Sender<Link>,
}

impl std::fmt::Debug for LinkAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkAcceptor").finish_non_exhaustive()
    }
}

impl ProtocolHandler for LinkAcceptor {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let links = self.links.clone();

        async move {
            let peer = PeerId::new(conn.remote_id().to_string());
            debug!(peer = %peer, "Router accepting sync connection");

            let (send, recv) = conn.accept_bi().await.map_err(AcceptError::from_err)?;
            let link = bridge(conn, send, recv, peer.clone(), Direction::Inbound);

            if links.send(link).await.is_err() {
                warn!(peer = %peer, "Transport is shutting down, dropping link");
            }
            Ok(())
        }
    }
}

/// iroh endpoint speaking the sync protocol
pub struct IrohTransport {
    endpoint: Endpoint,
    router: Router,
    static_provider: StaticProvider,
    incoming: Mutex<mpsc::Receiver<Link>>,
}

impl IrohTransport {
    /// Bind an endpoint with the given identity and start accepting links
    pub async fn bind(secret_key: SecretKey) -> SyncResult<Self> {
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![SYNC_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let (links, incoming) = mpsc::channel(LINK_BUFFER);
        let router = Router::builder(endpoint.clone())
            .accept(SYNC_ALPN, LinkAcceptor { links })
            .spawn();

        Ok(Self {
            endpoint,
            router,
            static_provider,
            incoming: Mutex::new(incoming),
        })
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Full address (relay and direct addresses) to hand to peers
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Make a peer reachable without discovery
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        info!(
            peer = %endpoint_addr.id,
            addrs = endpoint_addr.addrs.len(),
            "Adding peer address to static discovery"
        );
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    /// Register configured peer entries and return their transport IDs.
    ///
    /// Entries that carry addresses are added to static discovery so they
    /// can be dialed without any other discovery service.
    pub fn register_peers(&self, entries: &[String]) -> SyncResult<Vec<PeerId>> {
        let mut peers = Vec::with_capacity(entries.len());
        for entry in entries {
            let endpoint_addr = parse_peer_addr(entry)?;
            peers.push(PeerId::new(endpoint_addr.id.to_string()));
            if !endpoint_addr.addrs.is_empty() {
                self.add_peer_addr(endpoint_addr);
            }
        }
        Ok(peers)
    }

    /// Stop accepting links and close the endpoint
    pub async fn shutdown(&self) {
        info!("Shutting down transport");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
    }
}

impl Transport for IrohTransport {
    fn local_id(&self) -> PeerId {
        PeerId::new(self.endpoint.id().to_string())
    }

    async fn connect(&self, remote: &PeerId) -> SyncResult<Link> {
        let endpoint_id: EndpointId = remote
            .as_str()
            .parse()
            .map_err(|e| SyncError::Transport(format!("Invalid endpoint id {}: {}", remote, e)))?;

        let conn = self
            .endpoint
            .connect(endpoint_id, SYNC_ALPN)
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to connect to {}: {}", remote, e)))?;
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to open bi stream: {}", e)))?;

        debug!(peer = %remote, "Opened sync stream");
        Ok(bridge(conn, send, recv, remote.clone(), Direction::Outbound))
    }

    async fn accept(&self) -> Option<Link> {
        self.incoming.lock().await.recv().await
    }
}

/// Parse a peer entry of the form `<endpoint id>[@<addr>,<addr>...]`.
///
/// Each address is either a socket address or a relay URL.
pub fn parse_peer_addr(entry: &str) -> SyncResult<EndpointAddr> {
    let entry = entry.trim();
    let (id, addrs) = match entry.split_once('@') {
        Some((id, addrs)) => (id, addrs),
        None => (entry, ""),
    };

    let endpoint_id: EndpointId = id
        .parse()
        .map_err(|e| SyncError::Config(format!("Invalid endpoint id {}: {}", id, e)))?;
    let mut endpoint_addr = EndpointAddr::new(endpoint_id);

    for part in addrs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if part.contains("://") {
            let relay_url: RelayUrl = part
                .parse()
                .map_err(|e| SyncError::Config(format!("Invalid relay URL {}: {}", part, e)))?;
            endpoint_addr = endpoint_addr.with_relay_url(relay_url);
        } else {
            let socket_addr: SocketAddr = part
                .parse()
                .map_err(|e| SyncError::Config(format!("Invalid socket address {}: {}", part, e)))?;
            endpoint_addr = endpoint_addr.with_ip_addr(socket_addr);
        }
    }
    Ok(endpoint_addr)
}

/// Peer entry for `endpoint_addr`, in the form [`parse_peer_addr`] reads
pub fn format_peer_addr(endpoint_addr: &EndpointAddr) -> String {
    let addrs: Vec<String> = endpoint_addr
        .ip_addrs()
        .map(|addr| addr.to_string())
        .chain(endpoint_addr.relay_urls().map(|url| url.to_string()))
        .collect();
    if addrs.is_empty() {
        endpoint_addr.id.to_string()
    } else {
        format!("{}@{}", endpoint_addr.id, addrs.join(","))
    }
}

/// Load the endpoint secret key from `path`, creating it on first use
pub fn load_or_generate_secret_key(path: &Path) -> SyncResult<SecretKey> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        let bytes: [u8; 32] = hex::decode(raw.trim())
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                SyncError::Identity(format!("Corrupt endpoint key file {}", path.display()))
            })?;
        return Ok(SecretKey::from(bytes));
    }

    let secret_key = SecretKey::generate(&mut rand::rng());
    write_private_file(path, hex::encode(secret_key.to_bytes()).as_bytes())?;
    info!(path = %path.display(), "Generated endpoint key");
    Ok(secret_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_secret_key_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("endpoint.key");

        let first = load_or_generate_secret_key(&path).unwrap();
        let second = load_or_generate_secret_key(&path).unwrap();
        assert_eq!(first.public(), second.public());
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("endpoint.key");
        load_or_generate_secret_key(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_secret_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("endpoint.key");
        std::fs::write(&path, "zz").unwrap();

        assert!(matches!(
            load_or_generate_secret_key(&path),
            Err(SyncError::Identity(_))
        ));
    }

    #[test]
    fn test_peer_entry_with_addresses() {
        let id = SecretKey::generate(&mut rand::rng()).public();
        let entry = format!("{}@192.168.1.20:4433, https://relay.example.org./", id);

        let endpoint_addr = parse_peer_addr(&entry).unwrap();
        assert_eq!(endpoint_addr.id, id);
        assert_eq!(endpoint_addr.ip_addrs().count(), 1);
        assert_eq!(endpoint_addr.relay_urls().count(), 1);

        let again = parse_peer_addr(&format_peer_addr(&endpoint_addr)).unwrap();
        assert_eq!(again, endpoint_addr);
    }

    #[test]
    fn test_bare_peer_entry_has_no_addresses() {
        let id = SecretKey::generate(&mut rand::rng()).public();
        let endpoint_addr = parse_peer_addr(&format!(" {} ", id)).unwrap();
        assert!(endpoint_addr.addrs.is_empty());
        assert_eq!(format_peer_addr(&endpoint_addr), id.to_string());
    }

    #[test]
    fn test_bad_peer_entries_are_config_errors() {
        let id = SecretKey::generate(&mut rand::rng()).public();
        for entry in [
            "nope".to_string(),
            format!("{}@not-an-address", id),
            format!("{}@http://", id),
        ] {
            assert!(
                matches!(parse_peer_addr(&entry), Err(SyncError::Config(_))),
                "accepted {entry}"
            );
        }
    }

    #[tokio::test]
    async fn test_register_peers_returns_endpoint_ids() {
        let transport = IrohTransport::bind(SecretKey::generate(&mut rand::rng()))
            .await
            .unwrap();
        let bare = SecretKey::generate(&mut rand::rng()).public();
        let addressed = SecretKey::generate(&mut rand::rng()).public();

        let peers = transport
            .register_peers(&[bare.to_string(), format!("{}@127.0.0.1:9", addressed)])
            .unwrap();
        assert_eq!(
            peers,
            vec![PeerId::new(bare.to_string()), PeerId::new(addressed.to_string())]
        );
        assert_eq!(transport.endpoint_addr().id, transport.endpoint_id());
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_endpoint_id_fails_before_dialing() {
        let transport = IrohTransport::bind(SecretKey::generate(&mut rand::rng()))
            .await
            .unwrap();

        let result = transport.connect(&PeerId::new("not-an-endpoint")).await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
        transport.shutdown().await;
    }
}

//! Push/pull orchestration between the store and connected peers
//!
//! The coordinator turns local edits into `NoteUpdate` broadcasts, answers
//! `SyncRequest`s with every shared document, and runs incoming snapshots
//! through the [`Reconciler`] before writing the outcome to the store.
//!
//! ```text
//!  local edit ──> on_local_change ──encrypt──> broadcast NoteUpdate
//!
//!  inbox ──> run ─┬─ SyncRequest  ──> on_sync_request ──> SyncResponse
//!                 ├─ SyncResponse ──> on_sync_response ─┐
//!                 └─ NoteUpdate   ──> on_incoming_snapshot ──reconcile──> store
//! ```
//!
//! Inbound messages are handled one at a time, so store writes caused by
//! peers never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::connection::{BroadcastReport, ConnectionManager, InboundMessage};
use super::events::SyncEvent;
use super::protocol::ProtocolMessage;
use super::transport::Transport;
use crate::config::HiveConfig;
use crate::error::SyncResult;
use crate::reconcile::{Action, Reconciler};
use crate::storage::DocumentStore;
use crate::types::{now_millis, DocumentSnapshot, LocalDocument, PeerId, Timestamp};

/// Outcome of applying a batch of snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Snapshots that changed the store
    pub written: usize,
    /// Snapshots where the local copy was kept
    pub kept: usize,
    /// Snapshots that failed to decrypt or write
    pub failed: usize,
}

/// Applies the sync protocol on top of a connection manager and a store
pub struct SyncCoordinator<T: Transport, S: DocumentStore> {
    connections: ConnectionManager<T>,
    store: Arc<S>,
    reconciler: Reconciler,
    config: HiveConfig,
    /// Writes we made from remote snapshots, by path and stamped mtime
    applied: Mutex<HashMap<String, Timestamp>>,
}

impl<T: Transport, S: DocumentStore> SyncCoordinator<T, S> {
    pub fn new(
        connections: ConnectionManager<T>,
        store: Arc<S>,
        reconciler: Reconciler,
        config: HiveConfig,
    ) -> Self {
        Self {
            connections,
            store,
            reconciler,
            config,
            applied: Mutex::new(HashMap::new()),
        }
    }

    pub fn connections(&self) -> &ConnectionManager<T> {
        &self.connections
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Every shared document path in the store, sorted
    pub async fn shared_documents(&self) -> SyncResult<Vec<String>> {
        let all = self.store.list_all().await?;
        Ok(all
            .into_iter()
            .filter(|path| self.config.is_shared(path))
            .collect())
    }

    /// Encrypted snapshot of a local document
    pub async fn snapshot(&self, path: &str) -> SyncResult<DocumentSnapshot> {
        let text = self.store.read(path).await?;
        let last_modified = self.store.mtime(path).await?;
        Ok(DocumentSnapshot {
            path: path.to_string(),
            content: self.reconciler.cipher().encrypt(&text),
            last_modified,
        })
    }

    /// Push a locally modified document to every authenticated peer.
    ///
    /// Returns `None` when the path is not shared.
    pub async fn on_local_change(&self, path: &str) -> SyncResult<Option<BroadcastReport>> {
        if !self.config.is_shared(path) {
            debug!(path, "Ignoring change to unshared document");
            return Ok(None);
        }

        let snapshot = self.snapshot(path).await.inspect_err(|e| {
            warn!(path, error = %e, "Failed to snapshot changed document");
        })?;
        let report = self
            .connections
            .broadcast_to_peers(&ProtocolMessage::NoteUpdate(snapshot))?;

        info!(
            path,
            peers = report.attempted.len(),
            failed = report.failed.len(),
            "Pushed local change"
        );
        Ok(Some(report))
    }

    /// Answer a peer's `SyncRequest` with every shared document.
    ///
    /// Documents that cannot be read are skipped. The answer is split over
    /// as many `SyncResponse` messages as the link's frame limit needs.
    /// Returns how many snapshots were sent.
    pub async fn on_sync_request(&self, from: &PeerId) -> SyncResult<usize> {
        let mut snapshots = Vec::new();
        for path in self.shared_documents().await? {
            match self.snapshot(&path).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(path = %path, error = %e, "Skipping unreadable document"),
            }
        }

        let batches = self.pack_responses(snapshots)?;
        let count = batches.iter().map(Vec::len).sum();
        let messages = batches.len();
        for batch in batches {
            self.connections
                .send_to_peer(from, &ProtocolMessage::SyncResponse(batch))?;
        }
        info!(peer = %from, documents = count, messages, "Answered sync request");
        Ok(count)
    }

    /// Group snapshots into `SyncResponse` payloads that each encode within
    /// the frame limit. A snapshot too large for a frame of its own is dropped.
    fn pack_responses(
        &self,
        snapshots: Vec<DocumentSnapshot>,
    ) -> SyncResult<Vec<Vec<DocumentSnapshot>>> {
        let limit = self.connections.max_frame_length();
        let envelope = ProtocolMessage::SyncResponse(Vec::new()).encode()?.len();

        let mut batches = Vec::new();
        let mut current: Vec<DocumentSnapshot> = Vec::new();
        let mut size = envelope;
        for snapshot in snapshots {
            let len = serde_json::to_vec(&snapshot)?.len();
            if envelope + len > limit {
                warn!(path = %snapshot.path, bytes = len, limit, "Document too large to send");
                continue;
            }
            // one comma between array items
            if !current.is_empty() && size + 1 + len > limit {
                batches.push(std::mem::take(&mut current));
                size = envelope;
            }
            size += len + usize::from(!current.is_empty());
            current.push(snapshot);
        }
        if !current.is_empty() || batches.is_empty() {
            batches.push(current);
        }
        Ok(batches)
    }

    /// Reconcile one incoming snapshot and apply the result to the store
    pub async fn on_incoming_snapshot(&self, snapshot: &DocumentSnapshot) -> SyncResult<Action> {
        let result = self.apply_snapshot(snapshot).await;
        match &result {
            Ok(action) => self.connections.emit(SyncEvent::DocumentApplied {
                path: snapshot.path.clone(),
                action: action.kind(),
            }),
            Err(e) => {
                error!(path = %snapshot.path, error = %e, "Failed to apply snapshot");
                self.connections.emit(SyncEvent::SnapshotRejected {
                    path: snapshot.path.clone(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn apply_snapshot(&self, snapshot: &DocumentSnapshot) -> SyncResult<Action> {
        let path = snapshot.path.as_str();
        let local = self.load_local(path).await?;
        let action = self.reconciler.reconcile(snapshot, local.as_ref())?;

        match &action {
            Action::Create(text) => {
                self.store.create(path, text, snapshot.last_modified).await?;
                self.record_applied(path, snapshot.last_modified);
            }
            Action::Replace(text) => {
                self.store.write(path, text, snapshot.last_modified).await?;
                self.record_applied(path, snapshot.last_modified);
            }
            Action::Merge(text) => {
                // merged text is new to everyone, so it is left for the
                // change feed to push
                self.store.write(path, text, now_millis()).await?;
            }
            Action::KeepLocal => {}
        }

        debug!(path, action = %action.kind(), "Applied snapshot");
        Ok(action)
    }

    async fn load_local(&self, path: &str) -> SyncResult<Option<LocalDocument>> {
        if !self.store.exists(path).await? {
            return Ok(None);
        }
        let content = self.store.read(path).await?;
        let mtime = self.store.mtime(path).await?;
        Ok(Some(LocalDocument { mtime, content }))
    }

    fn record_applied(&self, path: &str, mtime: Timestamp) {
        self.applied.lock().insert(path.to_string(), mtime);
    }

    /// Whether the store's current version of `path` is one we wrote from a peer
    async fn is_own_write(&self, path: &str) -> bool {
        let recorded = self.applied.lock().get(path).copied();
        let Some(recorded) = recorded else {
            return false;
        };
        match self.store.mtime(path).await {
            Ok(mtime) if mtime == recorded => true,
            _ => {
                self.applied.lock().remove(path);
                false
            }
        }
    }

    /// Apply every snapshot of a `SyncResponse`; one failure does not stop the rest
    pub async fn on_sync_response(&self, snapshots: &[DocumentSnapshot]) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for snapshot in snapshots {
            match self.on_incoming_snapshot(snapshot).await {
                Ok(Action::KeepLocal) => summary.kept += 1,
                Ok(_) => summary.written += 1,
                Err(_) => summary.failed += 1,
            }
        }
        info!(
            written = summary.written,
            kept = summary.kept,
            failed = summary.failed,
            "Applied sync response"
        );
        summary
    }

    /// Ask every authenticated peer for its shared documents
    pub fn request_sync(&self) -> SyncResult<BroadcastReport> {
        let report = self
            .connections
            .broadcast_to_peers(&ProtocolMessage::SyncRequest)?;
        info!(peers = report.attempted.len(), "Requested sync");
        Ok(report)
    }

    /// Handle one message from an authenticated peer
    pub async fn handle(&self, inbound: InboundMessage) {
        let InboundMessage { from, message } = inbound;
        match message {
            ProtocolMessage::SyncRequest => {
                if let Err(e) = self.on_sync_request(&from).await {
                    warn!(peer = %from, error = %e, "Failed to answer sync request");
                }
            }
            ProtocolMessage::SyncResponse(snapshots) => {
                self.on_sync_response(&snapshots).await;
            }
            ProtocolMessage::NoteUpdate(snapshot) => {
                let _ = self.on_incoming_snapshot(&snapshot).await;
            }
            other => debug!(peer = %from, kind = other.kind(), "Ignoring handshake message"),
        }
    }

    /// Process the inbox until every sender is gone
    pub async fn run(&self, mut inbox: mpsc::Receiver<InboundMessage>) {
        while let Some(inbound) = inbox.recv().await {
            self.handle(inbound).await;
        }
        debug!("Coordinator inbox closed");
    }

    /// Push every path from the change feed, skipping our own writes
    pub async fn run_local_changes(&self, mut feed: mpsc::Receiver<String>) {
        while let Some(path) = feed.recv().await {
            if self.is_own_write(&path).await {
                debug!(path = %path, "Skipping change caused by a remote snapshot");
                continue;
            }
            let _ = self.on_local_change(&path).await;
        }
        debug!("Change feed closed");
    }

    /// Send a `SyncRequest` to each peer as soon as it authenticates
    pub async fn run_sync_on_connect(&self, mut events: broadcast::Receiver<SyncEvent>) {
        loop {
            match events.recv().await {
                Ok(SyncEvent::PeerAuthenticated { peer, .. }) => {
                    if let Err(e) = self
                        .connections
                        .send_to_peer(&peer, &ProtocolMessage::SyncRequest)
                    {
                        warn!(peer = %peer, error = %e, "Failed to request sync from new peer");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

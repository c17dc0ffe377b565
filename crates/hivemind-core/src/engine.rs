//! Main entry point for Hive Mind
//!
//! The `SyncEngine` builds the full stack from a [`HiveConfig`], a signing
//! key, a transport and a document store, then runs the background loops:
//!
//! - accept inbound links
//! - dispatch the coordinator inbox
//! - request a sync from each peer as it authenticates
//! - watch the store and push local changes
//! - redial configured peers

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::HiveConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::{Keypair, TrustStore};
use crate::reconcile::Reconciler;
use crate::storage::{ChangeWatcher, DocumentStore};
use crate::sync::{
    BroadcastReport, ConnectionManager, ConnectionState, InboundMessage, SyncCoordinator,
    SyncEvent, Transport,
};
use crate::types::PeerId;

/// A running Hive Mind node
pub struct SyncEngine<T: Transport, S: DocumentStore> {
    config: HiveConfig,
    trust: Arc<TrustStore>,
    coordinator: Arc<SyncCoordinator<T, S>>,
    inbox: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport, S: DocumentStore> SyncEngine<T, S> {
    /// Assemble a node; nothing runs until [`start`](Self::start)
    pub fn new(
        config: HiveConfig,
        keypair: Keypair,
        transport: T,
        store: Arc<S>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let local_id = transport.local_id();
        if config.peer_id.trim() != local_id.as_str() {
            return Err(SyncError::Config(format!(
                "peerId {} does not match this node's transport ID {}",
                config.peer_id, local_id
            )));
        }

        let trust = Arc::new(TrustStore::new(keypair, &config.trusted_peers));
        let (connections, inbox) =
            ConnectionManager::new(transport, trust.clone(), config.auth_timeout());
        let reconciler = Reconciler::new(config.cipher()?);
        let coordinator = Arc::new(SyncCoordinator::new(
            connections,
            store,
            reconciler,
            config.clone(),
        ));

        info!(
            peer_id = %config.peer_id,
            trusted = trust.trusted_keys().len(),
            "Sync engine created"
        );

        Ok(Self {
            config,
            trust,
            coordinator,
            inbox: Mutex::new(Some(inbox)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background loops; fails if already started
    pub fn start(&self) -> SyncResult<()> {
        let inbox = self
            .inbox
            .lock()
            .take()
            .ok_or_else(|| SyncError::Config("Sync engine already started".into()))?;

        let connections = self.coordinator.connections();
        let mut tasks = Vec::new();

        let events = connections.subscribe();
        let coordinator = self.coordinator.clone();
        tasks.push(tokio::spawn(async move {
            coordinator.run_sync_on_connect(events).await
        }));

        let coordinator = self.coordinator.clone();
        tasks.push(tokio::spawn(async move { coordinator.run(inbox).await }));

        tasks.push(connections.listen());

        let watcher = ChangeWatcher::new(self.coordinator.store().clone(), self.config.poll_interval());
        let (feed, watcher_task) = watcher.spawn();
        tasks.push(watcher_task);
        let coordinator = self.coordinator.clone();
        tasks.push(tokio::spawn(async move {
            coordinator.run_local_changes(feed).await
        }));

        let peers = self.config.peer_ids();
        if !peers.is_empty() {
            tasks.push(connections.maintain_connections(peers, self.config.reconnect_interval()));
        }

        info!(tasks = tasks.len(), "Sync engine started");
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Stop every background loop and close all links
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.coordinator.connections().shutdown();
        info!("Sync engine stopped");
    }

    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator<T, S>> {
        &self.coordinator
    }

    pub fn connections(&self) -> &ConnectionManager<T> {
        self.coordinator.connections()
    }

    /// Our transport-level ID
    pub fn local_id(&self) -> &PeerId {
        self.connections().local_id()
    }

    /// Our signing key, base64; peers put this in their trusted list
    pub fn public_key_base64(&self) -> String {
        self.trust.public_key_base64()
    }

    /// Replace the trusted key list
    pub fn reload_trusted<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.trust.reload(keys);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.connections().subscribe()
    }

    pub async fn connect(&self, peer: &PeerId) -> SyncResult<bool> {
        self.connections().connect_to_peer(peer).await
    }

    pub fn disconnect(&self, peer: &PeerId) -> bool {
        self.connections().disconnect(peer)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections().connected_peers()
    }

    pub fn connection_state(&self, peer: &PeerId) -> ConnectionState {
        self.connections().connection_state(peer)
    }

    /// Ask every connected peer for its shared documents
    pub fn request_sync(&self) -> SyncResult<BroadcastReport> {
        self.coordinator.request_sync()
    }

    /// Push a changed document now instead of waiting for the watcher
    pub async fn push_change(&self, path: &str) -> SyncResult<Option<BroadcastReport>> {
        self.coordinator.on_local_change(path).await
    }

    pub async fn shared_documents(&self) -> SyncResult<Vec<String>> {
        self.coordinator.shared_documents().await
    }
}

impl<T: Transport, S: DocumentStore> Drop for SyncEngine<T, S> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        if !tasks.is_empty() {
            warn!(tasks = tasks.len(), "Sync engine dropped while running");
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

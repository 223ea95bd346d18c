/// Composition root: wires every component of one client instance
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    history_shortcut, ConflictArbiter, EventBus, EventDisposition, FieldChangeAggregator,
    FieldEvent, FieldSurface, HistoryDirection, HistoryManager, HttpGateway, KeyChord, LocalStore,
    PersistenceGateway, ReentrancyFlag, Result, StorageQueue, SyncConfig, SyncRole,
    SyncRoleController, Timestamp, UiEvent,
};

/// Point-in-time diagnostics of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub role: SyncRole,
    pub last_applied: Timestamp,
    pub can_undo: bool,
    pub can_redo: bool,
    pub undo_depth: usize,
    pub redo_depth: usize,
    pub pending_storage_ops: usize,
    pub pending_commits: usize,
    pub reads_suspended: bool,
}

pub struct HangarClient {
    bus: EventBus,
    storage: Arc<StorageQueue>,
    arbiter: Arc<ConflictArbiter>,
    controller: Arc<SyncRoleController>,
    history: Arc<HistoryManager>,
    aggregator: Arc<FieldChangeAggregator>,
}

impl HangarClient {
    pub fn new(
        config: SyncConfig,
        gateway: Arc<dyn PersistenceGateway>,
        surface: Arc<dyn FieldSurface>,
        store: Arc<dyn LocalStore>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::default();
        let storage = Arc::new(StorageQueue::start(store, config.storage_pause()));
        let arbiter = Arc::new(ConflictArbiter::new(
            surface.clone(),
            ReentrancyFlag::new(),
            config.write_fence(),
        ));
        let controller = Arc::new(SyncRoleController::new(
            &config,
            gateway,
            arbiter.clone(),
            surface.clone(),
            storage.clone(),
            bus.clone(),
        ));
        let history = Arc::new(HistoryManager::new(
            config.history_limit,
            surface.clone(),
            arbiter.clone(),
            controller.clone(),
            storage.clone(),
            bus.clone(),
        ));
        let aggregator = Arc::new(FieldChangeAggregator::new(
            &config,
            surface,
            arbiter.clone(),
            history.clone(),
            controller.clone(),
            storage.clone(),
        ));

        Ok(Self {
            bus,
            storage,
            arbiter,
            controller,
            history,
            aggregator,
        })
    }

    /// Client talking to the HTTP endpoint named in `config`.
    pub fn connect(
        config: SyncConfig,
        surface: Arc<dyn FieldSurface>,
        store: Arc<dyn LocalStore>,
    ) -> Result<Self> {
        let gateway = Arc::new(HttpGateway::new(&config)?);
        info!(
            "connecting to {} as session {}",
            config.endpoint,
            gateway.session_id()
        );
        Self::new(config, gateway, surface, store)
    }

    /// Reload persisted history and re-enter the previously saved role.
    pub async fn start(&self) -> Result<SyncRole> {
        self.history.load_persisted().await?;
        Ok(self.controller.restore_saved_role().await)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.bus.subscribe()
    }

    pub async fn update_sync_mode(&self, read: bool, write: bool) -> SyncRole {
        self.controller.update_sync_mode(read, write).await
    }

    pub fn handle_event(&self, event: FieldEvent) -> EventDisposition {
        self.aggregator.handle(event)
    }

    /// Route a key press. Returns whether history changed.
    pub async fn handle_key(&self, chord: &KeyChord) -> Result<bool> {
        match history_shortcut(chord) {
            Some(HistoryDirection::Undo) => self.history.undo().await,
            Some(HistoryDirection::Redo) => self.history.redo().await,
            None => Ok(false),
        }
    }

    pub async fn undo(&self) -> Result<bool> {
        self.history.undo().await
    }

    pub async fn redo(&self) -> Result<bool> {
        self.history.redo().await
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub async fn clear_history(&self) {
        self.history.clear_history().await;
    }

    pub fn controller(&self) -> &Arc<SyncRoleController> {
        &self.controller
    }

    pub fn history(&self) -> &Arc<HistoryManager> {
        &self.history
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            role: self.controller.role(),
            last_applied: self.arbiter.last_applied(),
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
            undo_depth: self.history.undo_depth(),
            redo_depth: self.history.redo_depth(),
            pending_storage_ops: self.storage.pending(),
            pending_commits: self.aggregator.pending_commits(),
            reads_suspended: self.controller.reads_suspended(),
        }
    }
}

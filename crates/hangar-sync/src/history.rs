/// History manager: bounded undo/redo of full tile snapshots
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::{
    apply_tile_writes, capture_tiles, plan_tile_writes, ConflictArbiter, EventBus, FieldSurface,
    HistoryDirection, MissingElement, NotificationLevel, ReentrancyFlag, Result, RoleHandle,
    ServerSnapshot, StoragePriority, StorageQueue, SyncError, SyncRole, SyncRoleController,
    TileState, Timestamp, UiEvent, HISTORY_KEY, PLANNER_DATA_KEY,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: Timestamp,
    pub tiles: Vec<TileState>,
}

impl HistoryEntry {
    pub fn new(tiles: Vec<TileState>) -> Self {
        Self {
            timestamp: Timestamp::now(),
            tiles,
        }
    }
}

/// Both stacks as stored under [`HISTORY_KEY`], oldest entry first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedHistory {
    #[serde(default)]
    pub undo_stack: Vec<HistoryEntry>,
    #[serde(default)]
    pub redo_stack: Vec<HistoryEntry>,
}

#[derive(Debug, Default)]
struct Stacks {
    undo: VecDeque<HistoryEntry>,
    redo: VecDeque<HistoryEntry>,
}

impl Stacks {
    fn source(&mut self, direction: HistoryDirection) -> &mut VecDeque<HistoryEntry> {
        match direction {
            HistoryDirection::Undo => &mut self.undo,
            HistoryDirection::Redo => &mut self.redo,
        }
    }

    fn opposite(&mut self, direction: HistoryDirection) -> &mut VecDeque<HistoryEntry> {
        match direction {
            HistoryDirection::Undo => &mut self.redo,
            HistoryDirection::Redo => &mut self.undo,
        }
    }
}

fn push_bounded(stack: &mut VecDeque<HistoryEntry>, entry: HistoryEntry, limit: usize) {
    stack.push_back(entry);
    while stack.len() > limit {
        stack.pop_front();
    }
}

pub struct HistoryManager {
    surface: Arc<dyn FieldSurface>,
    arbiter: Arc<ConflictArbiter>,
    controller: Arc<SyncRoleController>,
    storage: Arc<StorageQueue>,
    bus: EventBus,
    role: RoleHandle,
    limit: usize,
    stacks: Mutex<Stacks>,
    restoring: ReentrancyFlag,
}

impl HistoryManager {
    pub fn new(
        limit: usize,
        surface: Arc<dyn FieldSurface>,
        arbiter: Arc<ConflictArbiter>,
        controller: Arc<SyncRoleController>,
        storage: Arc<StorageQueue>,
        bus: EventBus,
    ) -> Self {
        let role = controller.role_handle();
        Self {
            surface,
            arbiter,
            controller,
            storage,
            bus,
            role,
            limit: limit.max(1),
            stacks: Mutex::new(Stacks::default()),
            restoring: ReentrancyFlag::new(),
        }
    }

    /// Set while an undo/redo is writing fields.
    pub fn restore_guard(&self) -> ReentrancyFlag {
        self.restoring.clone()
    }

    pub fn can_undo(&self) -> bool {
        !self.role.current().is_read_only() && !self.stacks.lock().undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.role.current().is_read_only() && !self.stacks.lock().redo.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.stacks.lock().undo.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.stacks.lock().redo.len()
    }

    /// Undo stack, oldest first.
    pub fn undo_entries(&self) -> Vec<HistoryEntry> {
        self.stacks.lock().undo.iter().cloned().collect()
    }

    /// Current surface state, as it would be recorded.
    pub fn capture(&self) -> Vec<TileState> {
        capture_tiles(self.surface.as_ref())
    }

    /// Record `tiles` as the next undo target. Returns whether it was recorded.
    ///
    /// Ignored under the read-only role, while a restore or a server apply is
    /// in progress, and when equal to the current top entry. A recorded entry
    /// discards the redo branch.
    pub async fn push_state(&self, tiles: Vec<TileState>) -> bool {
        if self.role.current() == SyncRole::Sync {
            debug!("history capture ignored in read-only mode");
            return false;
        }
        if self.restoring.is_active() || self.arbiter.is_applying() {
            debug!("history capture suppressed during restore/apply");
            return false;
        }

        {
            let mut stacks = self.stacks.lock();
            if stacks.undo.back().is_some_and(|top| top.tiles == tiles) {
                return false;
            }
            push_bounded(&mut stacks.undo, HistoryEntry::new(tiles), self.limit);
            stacks.redo.clear();
        }

        self.persist().await;
        self.announce_change();
        true
    }

    pub async fn undo(&self) -> Result<bool> {
        self.step(HistoryDirection::Undo).await
    }

    pub async fn redo(&self) -> Result<bool> {
        self.step(HistoryDirection::Redo).await
    }

    /// Move one entry between the stacks. Stack bookkeeping is committed only
    /// after the restore succeeded.
    async fn step(&self, direction: HistoryDirection) -> Result<bool> {
        let verb = match direction {
            HistoryDirection::Undo => "Undo",
            HistoryDirection::Redo => "Redo",
        };
        if self.role.current().is_read_only() {
            self.bus.notify(
                NotificationLevel::Warning,
                format!("{} is disabled in read-only sync mode", verb),
            );
            return Ok(false);
        }

        let target = self.stacks.lock().source(direction).back().cloned();
        let Some(target) = target else {
            self.bus.notify(
                NotificationLevel::Warning,
                format!("Nothing to {}", verb.to_lowercase()),
            );
            return Ok(false);
        };
        let current = self.capture();

        let written = match self.restore(&target.tiles, &current) {
            Ok(written) => written,
            Err(e) => {
                error!("{} failed: {}", verb, e);
                self.bus
                    .notify(NotificationLevel::Error, format!("{} failed: {}", verb, e));
                return Err(SyncError::HistoryRestore(e.to_string()));
            }
        };

        {
            let mut stacks = self.stacks.lock();
            stacks.source(direction).pop_back();
            push_bounded(
                stacks.opposite(direction),
                HistoryEntry::new(current),
                self.limit,
            );
        }
        debug!("{} restored {} fields", verb, written);

        self.persist().await;
        self.bus.emit(UiEvent::HistoryRestored { direction });
        self.announce_change();
        self.commit_restored(&target.tiles).await;
        Ok(true)
    }

    fn restore(&self, tiles: &[TileState], current: &[TileState]) -> Result<usize> {
        let _guard = self.restoring.acquire();
        let surface = self.surface.as_ref();
        let plan = plan_tile_writes(surface, tiles, MissingElement::Fail, |_| false)?;

        match apply_tile_writes(surface, &plan) {
            Ok(written) => {
                if self.role.current().can_write() {
                    for (field, _) in &plan {
                        self.arbiter.mark_pending_write(*field);
                    }
                }
                Ok(written)
            }
            Err(e) => {
                let rollback = plan_tile_writes(surface, current, MissingElement::Skip, |_| false)
                    .and_then(|plan| apply_tile_writes(surface, &plan));
                if let Err(rollback_err) = rollback {
                    warn!("rollback after failed restore incomplete: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Same downstream path as a committed user edit.
    async fn commit_restored(&self, tiles: &[TileState]) {
        let cache = ServerSnapshot::new(tiles.to_vec(), Timestamp::now());
        if let Err(e) = self
            .storage
            .save(PLANNER_DATA_KEY, &cache, StoragePriority::Normal)
            .await
        {
            warn!("failed to cache restored state: {}", e);
        }
        if self.role.current().can_write() {
            // Failures are logged and announced by the controller.
            let _ = self.controller.push_now().await;
        }
    }

    /// Drop both stacks. Callers confirm with the user first.
    pub async fn clear_history(&self) {
        {
            let mut stacks = self.stacks.lock();
            stacks.undo.clear();
            stacks.redo.clear();
        }
        self.persist().await;
        self.announce_change();
    }

    /// Reload stacks persisted by an earlier session, keeping the newest
    /// `limit` entries of each.
    pub async fn load_persisted(&self) -> Result<()> {
        let persisted = self
            .storage
            .load_typed::<PersistedHistory>(HISTORY_KEY)
            .await?
            .unwrap_or_default();

        {
            let mut stacks = self.stacks.lock();
            stacks.undo.clear();
            stacks.redo.clear();
            for entry in persisted.undo_stack {
                push_bounded(&mut stacks.undo, entry, self.limit);
            }
            for entry in persisted.redo_stack {
                push_bounded(&mut stacks.redo, entry, self.limit);
            }
        }
        self.announce_change();
        Ok(())
    }

    async fn persist(&self) {
        let persisted = {
            let stacks = self.stacks.lock();
            PersistedHistory {
                undo_stack: stacks.undo.iter().cloned().collect(),
                redo_stack: stacks.redo.iter().cloned().collect(),
            }
        };
        if let Err(e) = self
            .storage
            .save(HISTORY_KEY, &persisted, StoragePriority::Normal)
            .await
        {
            warn!("failed to persist history: {}", e);
        }
    }

    fn announce_change(&self) {
        self.bus.emit(UiEvent::HistoryChanged {
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CellId, FieldId, GridSurface, MemoryGateway, MemoryStore, SyncConfig};
    use std::time::Duration;

    struct Fixture {
        history: HistoryManager,
        controller: Arc<SyncRoleController>,
        surface: Arc<GridSurface>,
        store: MemoryStore,
        gateway: MemoryGateway,
        bus: EventBus,
    }

    fn fixture_with_store(store: MemoryStore) -> Fixture {
        let config = SyncConfig::default();
        let gateway = MemoryGateway::new();
        let surface = Arc::new(GridSurface::with_tiles(4, 2));
        let storage = Arc::new(StorageQueue::start(Arc::new(store.clone()), Duration::ZERO));
        let arbiter = Arc::new(ConflictArbiter::new(
            surface.clone(),
            ReentrancyFlag::new(),
            config.write_fence(),
        ));
        let bus = EventBus::default();
        let controller = Arc::new(SyncRoleController::new(
            &config,
            Arc::new(gateway.clone()),
            arbiter.clone(),
            surface.clone(),
            storage.clone(),
            bus.clone(),
        ));
        let history = HistoryManager::new(
            config.history_limit,
            surface.clone(),
            arbiter,
            controller.clone(),
            storage,
            bus.clone(),
        );
        Fixture {
            history,
            controller,
            surface,
            store,
            gateway,
            bus,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(MemoryStore::new())
    }

    fn field(s: &str) -> FieldId {
        s.parse().unwrap()
    }

    /// Record the current state, then edit `id` (what a committed edit does).
    async fn edit(f: &Fixture, id: &str, value: &str) {
        let before = f.history.capture();
        f.surface
            .write(field(id).container(), &field(id), value)
            .unwrap();
        f.history.push_state(before).await;
    }

    #[tokio::test]
    async fn test_redo_after_undo_is_identity() {
        let f = fixture();
        edit(&f, "aircraft-1", "D-AAAA").await;
        edit(&f, "notes-1", "hangar door stuck").await;
        let s = f.history.capture();

        assert!(f.history.undo().await.unwrap());
        let undone = f.history.capture();
        assert_eq!(f.surface.read(&field("notes-1")).as_deref(), Some(""));

        assert!(f.history.redo().await.unwrap());
        assert_eq!(f.history.capture(), s);

        assert!(f.history.undo().await.unwrap());
        assert_eq!(f.history.capture(), undone);
    }

    #[tokio::test]
    async fn test_history_keeps_five_most_recent() {
        let f = fixture();
        for i in 0..7 {
            edit(&f, "aircraft-2", &format!("D-EDT{}", i)).await;
        }
        assert_eq!(f.history.undo_depth(), 5);

        let oldest = &f.history.undo_entries()[0];
        let tile = oldest.tiles.iter().find(|t| t.cell_id == CellId(2)).unwrap();
        assert_eq!(tile.aircraft_id.as_deref(), Some("D-EDT1"));

        for _ in 0..5 {
            assert!(f.history.undo().await.unwrap());
        }
        assert!(!f.history.can_undo());
        assert!(!f.history.undo().await.unwrap());
        assert_eq!(
            f.surface.read(&field("aircraft-2")).as_deref(),
            Some("D-EDT1")
        );
    }

    #[tokio::test]
    async fn test_new_edit_discards_redo_branch() {
        let f = fixture();
        edit(&f, "aircraft-1", "A").await;
        edit(&f, "aircraft-1", "B").await;
        f.history.undo().await.unwrap();
        assert!(f.history.can_redo());

        edit(&f, "aircraft-1", "C").await;
        assert!(!f.history.can_redo());
    }

    #[tokio::test]
    async fn test_duplicate_state_is_not_pushed() {
        let f = fixture();
        let state = f.history.capture();
        assert!(f.history.push_state(state.clone()).await);
        assert!(!f.history.push_state(state).await);
        assert_eq!(f.history.undo_depth(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_role_blocks_history() {
        let f = fixture();
        edit(&f, "aircraft-1", "D-AAAA").await;
        f.controller.update_sync_mode(true, false).await;
        let mut events = f.bus.subscribe();
        let writes = f.surface.write_count();

        assert!(!f.history.push_state(f.history.capture()).await);
        assert!(!f.history.undo().await.unwrap());
        assert!(!f.history.redo().await.unwrap());
        assert!(!f.history.can_undo());
        assert_eq!(f.history.undo_depth(), 1);
        assert_eq!(f.surface.write_count(), writes);

        let event = events.try_recv().unwrap();
        assert!(matches!(
            event,
            UiEvent::Notification(n) if n.level == NotificationLevel::Warning
        ));
    }

    #[tokio::test]
    async fn test_failed_restore_leaves_stacks_intact() {
        let f = fixture();
        edit(&f, "aircraft-3", "D-GONE").await;
        f.surface.remove_element(&field("aircraft-3"));

        let err = f.history.undo().await.unwrap_err();
        assert!(matches!(err, SyncError::HistoryRestore(_)));
        assert_eq!(f.history.undo_depth(), 1);
        assert_eq!(f.history.redo_depth(), 0);
    }

    #[tokio::test]
    async fn test_capture_suppressed_while_restoring() {
        let f = fixture();
        let _guard = f.history.restore_guard().acquire();
        assert!(!f.history.push_state(f.history.capture()).await);
        assert_eq!(f.history.undo_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_undo_is_pushed() {
        let f = fixture();
        f.controller.update_sync_mode(true, true).await;
        edit(&f, "aircraft-4", "D-PUSH").await;
        f.controller.push_now().await.unwrap();
        let saves = f.gateway.save_count();

        f.history.undo().await.unwrap();
        assert_eq!(f.gateway.save_count(), saves + 1);
        let stored = f.gateway.current().unwrap();
        assert_eq!(
            stored.tile(CellId(4)).unwrap().aircraft_id.as_deref(),
            Some("")
        );
    }

    #[tokio::test]
    async fn test_history_survives_reload_and_clear() {
        let f = fixture();
        edit(&f, "aircraft-1", "D-AAAA").await;
        edit(&f, "aircraft-1", "D-BBBB").await;
        assert!(f.store.peek(HISTORY_KEY).is_some());

        let g = fixture_with_store(f.store.clone());
        g.history.load_persisted().await.unwrap();
        assert_eq!(g.history.undo_depth(), 2);

        g.history.clear_history().await;
        assert!(!g.history.can_undo());
        let persisted: PersistedHistory =
            serde_json::from_str(&f.store.peek(HISTORY_KEY).unwrap()).unwrap();
        assert!(persisted.undo_stack.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_history_falls_back_to_empty() {
        let store = MemoryStore::new();
        store.put(HISTORY_KEY, "[[[");
        let f = fixture_with_store(store);
        f.history.load_persisted().await.unwrap();
        assert_eq!(f.history.undo_depth(), 0);
        assert!(f.store.peek(HISTORY_KEY).is_none());
    }
}

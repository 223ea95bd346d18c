/// Sync role controller: role state machine, polling, and master pushes
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    capture_tiles, ApplyOutcome, ConflictArbiter, EventBus, FieldSurface, KeyedDebouncer,
    NotificationLevel, PeriodicTask, PersistenceGateway, Result, RoleCell, RoleHandle,
    ServerSnapshot, StoragePriority, StorageQueue, SyncConfig, SyncError, SyncRole, TileState,
    Timestamp, UiEvent, PLANNER_DATA_KEY, SYNC_SETTINGS_KEY,
};

/// Role toggles as persisted in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    pub read_enabled: bool,
    pub write_enabled: bool,
    pub role: SyncRole,
}

impl From<SyncRole> for SyncSettings {
    fn from(role: SyncRole) -> Self {
        Self {
            read_enabled: role.can_read(),
            write_enabled: role.can_write(),
            role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not polled: role, suspension or a poll already in flight.
    Skipped,
    /// The timestamp probe showed nothing newer.
    Unchanged,
    /// Nothing stored on the server yet.
    Empty,
    Fetched(ApplyOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Not pushed: role, or a push already in flight (it will run again).
    Skipped,
    /// Tiles equal what was last pushed or applied.
    Unchanged,
    Saved(Timestamp),
}

#[derive(Default)]
struct Timers {
    poll: Option<PeriodicTask>,
    push: Option<PeriodicTask>,
}

pub struct SyncRoleController {
    gateway: Arc<dyn PersistenceGateway>,
    arbiter: Arc<ConflictArbiter>,
    surface: Arc<dyn FieldSurface>,
    storage: Arc<StorageQueue>,
    bus: EventBus,
    role: RoleCell,
    poll_interval: Duration,
    push_interval: Duration,
    display_name: Option<String>,
    timers: Mutex<Timers>,
    push_debounce: KeyedDebouncer<()>,
    poll_flight: tokio::sync::Mutex<()>,
    push_flight: tokio::sync::Mutex<()>,
    push_again: AtomicBool,
    reads_suspended: AtomicBool,
    /// Set after a failed read until the server answers again.
    read_failing: AtomicBool,
    /// Tiles as last pushed or applied; the change-detection baseline.
    last_synced: Mutex<Option<Vec<TileState>>>,
    /// Server settings carried forward on every push.
    settings: Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl SyncRoleController {
    pub fn new(
        config: &SyncConfig,
        gateway: Arc<dyn PersistenceGateway>,
        arbiter: Arc<ConflictArbiter>,
        surface: Arc<dyn FieldSurface>,
        storage: Arc<StorageQueue>,
        bus: EventBus,
    ) -> Self {
        Self {
            gateway,
            arbiter,
            surface,
            storage,
            bus,
            role: RoleCell::new(SyncRole::Standalone),
            poll_interval: config.poll_interval(),
            push_interval: config.push_interval(),
            display_name: config.display_name.clone(),
            timers: Mutex::new(Timers::default()),
            push_debounce: KeyedDebouncer::new(),
            poll_flight: tokio::sync::Mutex::new(()),
            push_flight: tokio::sync::Mutex::new(()),
            push_again: AtomicBool::new(false),
            reads_suspended: AtomicBool::new(false),
            read_failing: AtomicBool::new(false),
            last_synced: Mutex::new(None),
            settings: Mutex::new(serde_json::Map::new()),
        }
    }

    pub fn role(&self) -> SyncRole {
        self.role.get()
    }

    pub fn role_handle(&self) -> RoleHandle {
        self.role.handle()
    }

    pub fn reads_suspended(&self) -> bool {
        self.reads_suspended.load(Ordering::SeqCst)
    }

    pub fn has_poll_timer(&self) -> bool {
        self.timers.lock().poll.is_some()
    }

    pub fn has_push_timer(&self) -> bool {
        self.timers.lock().push.is_some()
    }

    /// Entry point of the read/write toggles.
    pub async fn update_sync_mode(self: &Arc<Self>, read: bool, write: bool) -> SyncRole {
        let role = SyncRole::from_toggles(read, write);
        self.set_role(role).await;
        role
    }

    /// Switch roles. Old timers are cancelled before the new role is
    /// visible; entering a reading role polls immediately.
    pub async fn set_role(self: &Arc<Self>, role: SyncRole) {
        if self.role.get() == role {
            debug!("sync role already {}", role);
            return;
        }

        self.stop_timers();
        if !role.can_write() {
            self.arbiter.clear_pending_writes();
        }
        let previous = self.role.set(role);
        info!("sync role changed: {} -> {}", previous, role);

        let settings = SyncSettings::from(role);
        if let Err(e) = self
            .storage
            .save(SYNC_SETTINGS_KEY, &settings, StoragePriority::Normal)
            .await
        {
            warn!("failed to persist sync settings: {}", e);
        }
        self.bus.emit(UiEvent::SyncModeChanged { role });

        if role.can_read() {
            self.start_timers();
            // A failure on entry is always reported, even if one was before.
            self.read_failing.store(false, Ordering::SeqCst);
            match self.poll_now().await {
                Ok(PollOutcome::Fetched(ApplyOutcome::Applied { .. })) => {
                    self.bus.notify(NotificationLevel::Success, "Server data loaded")
                }
                Ok(_) => {}
                Err(e) => debug!("initial poll after role change failed: {}", e),
            }
        }
    }

    /// Re-enter the role stored by a previous session.
    pub async fn restore_saved_role(self: &Arc<Self>) -> SyncRole {
        match self.storage.load_typed::<SyncSettings>(SYNC_SETTINGS_KEY).await {
            Ok(Some(settings)) => {
                self.set_role(settings.role).await;
            }
            Ok(None) => debug!("no saved sync settings"),
            Err(e) => warn!("failed to read saved sync settings: {}", e),
        }
        self.role.get()
    }

    fn stop_timers(&self) {
        let mut timers = self.timers.lock();
        if let Some(poll) = timers.poll.take() {
            poll.stop();
        }
        if let Some(push) = timers.push.take() {
            push.stop();
        }
        self.push_debounce.cancel_all();
    }

    fn start_timers(self: &Arc<Self>) {
        let role = self.role.get();
        let mut timers = self.timers.lock();
        if role.can_read() && !self.reads_suspended() && timers.poll.is_none() {
            timers.poll = Some(self.poll_timer());
        }
        if role.can_write() && timers.push.is_none() {
            let weak = Arc::downgrade(self);
            timers.push = Some(PeriodicTask::start(self.push_interval, move || {
                let weak = Weak::clone(&weak);
                async move {
                    if let Some(controller) = weak.upgrade() {
                        let _ = controller.push_now().await;
                    }
                }
            }));
        }
    }

    fn poll_timer(self: &Arc<Self>) -> PeriodicTask {
        let weak = Arc::downgrade(self);
        PeriodicTask::start(self.poll_interval, move || {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(controller) = weak.upgrade() {
                    let _ = controller.poll_now().await;
                }
            }
        })
    }

    /// Stop polling around a destructive local operation.
    pub fn suspend_reads(&self) {
        self.reads_suspended.store(true, Ordering::SeqCst);
        if let Some(poll) = self.timers.lock().poll.take() {
            poll.stop();
        }
        debug!("server reads suspended");
    }

    pub async fn resume_reads(self: &Arc<Self>, immediate: bool) {
        self.reads_suspended.store(false, Ordering::SeqCst);
        if !self.role.get().can_read() {
            return;
        }
        {
            let mut timers = self.timers.lock();
            if timers.poll.is_none() {
                timers.poll = Some(self.poll_timer());
            }
        }
        debug!("server reads resumed");
        if immediate {
            let _ = self.poll_now().await;
        }
    }

    /// One poll cycle: probe the timestamp, load only when the server moved
    /// ahead, hand the snapshot to the arbiter. Failures leave local state
    /// untouched; the next tick is the retry.
    pub async fn poll_now(&self) -> Result<PollOutcome> {
        if !self.role.get().can_read() || self.reads_suspended() {
            return Ok(PollOutcome::Skipped);
        }
        let Ok(_flight) = self.poll_flight.try_lock() else {
            debug!("poll already in flight, skipping tick");
            return Ok(PollOutcome::Skipped);
        };
        self.fetch_and_apply().await
    }

    async fn fetch_and_apply(&self) -> Result<PollOutcome> {
        let remote = self
            .gateway
            .timestamp()
            .await
            .map_err(|e| self.read_failed(e))?;
        if remote <= self.arbiter.last_applied() {
            self.read_recovered();
            return Ok(PollOutcome::Unchanged);
        }

        let snapshot = self.gateway.load().await.map_err(|e| self.read_failed(e))?;
        self.read_recovered();
        let Some(snapshot) = snapshot else {
            return Ok(PollOutcome::Empty);
        };
        if !self.role.get().can_read() {
            debug!("role changed while loading, dropping snapshot");
            return Ok(PollOutcome::Skipped);
        }

        let outcome = self.arbiter.apply(&snapshot)?;
        if let ApplyOutcome::Applied {
            timestamp,
            fields_written,
        } = outcome
        {
            // Unpushed local edits keep the tiles dirty for the next push.
            *self.last_synced.lock() = if self.arbiter.has_pending_writes() {
                None
            } else {
                Some(capture_tiles(self.surface.as_ref()))
            };
            *self.settings.lock() = snapshot.settings.clone();
            self.bus.emit(UiEvent::ServerDataApplied {
                timestamp,
                fields_written,
            });
            self.cache_locally(&snapshot).await;
        }
        Ok(PollOutcome::Fetched(outcome))
    }

    /// Push the current tiles if they changed. Master only.
    pub async fn push_now(&self) -> Result<PushOutcome> {
        if !self.role.get().can_write() {
            return Ok(PushOutcome::Skipped);
        }
        let Ok(_flight) = self.push_flight.try_lock() else {
            self.push_again.store(true, Ordering::SeqCst);
            return Ok(PushOutcome::Skipped);
        };

        loop {
            self.push_again.store(false, Ordering::SeqCst);
            let outcome = self.push_once().await?;
            if !self.push_again.swap(false, Ordering::SeqCst) {
                return Ok(outcome);
            }
        }
    }

    async fn push_once(&self) -> Result<PushOutcome> {
        // Never overwrite newer server data blindly.
        match self.gateway.timestamp().await {
            Ok(remote) if remote > self.arbiter.last_applied() => {
                info!("server data newer than local ({}), pulling before push", remote);
                self.fetch_and_apply().await?;
            }
            Ok(_) => self.read_recovered(),
            Err(e) => return Err(self.read_failed(e)),
        }

        let generation = self.arbiter.pending_generation();
        let tiles = capture_tiles(self.surface.as_ref());
        if self.last_synced.lock().as_ref() == Some(&tiles) {
            self.arbiter.release_pending_writes(generation);
            return Ok(PushOutcome::Unchanged);
        }

        let mut snapshot = ServerSnapshot::new(tiles.clone(), self.arbiter.last_applied());
        snapshot.settings = self.settings.lock().clone();
        snapshot.metadata.last_writer = self.display_name.clone();

        let ack = self
            .gateway
            .save(&snapshot)
            .await
            .map_err(|e| self.push_failed(e))?;
        self.arbiter.note_local_write(ack.timestamp);
        self.arbiter.release_pending_writes(generation);
        *self.last_synced.lock() = Some(tiles);
        snapshot.metadata.timestamp = ack.timestamp;
        self.cache_locally(&snapshot).await;
        debug!("pushed {} tiles at {}", snapshot.tiles.len(), ack.timestamp);
        self.read_recovered();
        self.bus
            .notify(NotificationLevel::Success, "Changes saved to server");
        Ok(PushOutcome::Saved(ack.timestamp))
    }

    fn push_failed(&self, e: SyncError) -> SyncError {
        warn!("push to server failed: {}", e);
        self.bus
            .notify(NotificationLevel::Error, format!("Server sync failed: {}", e));
        e
    }

    /// Only the first failure of an outage reaches the user.
    fn read_failed(&self, e: SyncError) -> SyncError {
        if self.read_failing.swap(true, Ordering::SeqCst) {
            warn!("reading server data failed, keeping local data: {}", e);
        } else {
            self.bus.notify(
                NotificationLevel::Warning,
                format!("Server data could not be loaded: {}", e),
            );
        }
        e
    }

    fn read_recovered(&self) {
        if self.read_failing.swap(false, Ordering::SeqCst) {
            self.bus
                .notify(NotificationLevel::Info, "Server connection restored");
        }
    }

    /// Batch pushes behind a trailing delay; a zero delay flushes at once.
    pub fn schedule_push(self: &Arc<Self>, delay: Duration) {
        if !self.role.get().can_write() {
            return;
        }
        let weak = Arc::downgrade(self);
        self.push_debounce.schedule((), delay, async move {
            if let Some(controller) = weak.upgrade() {
                let _ = controller.push_now().await;
            }
        });
    }

    pub fn pending_push(&self) -> bool {
        self.push_debounce.pending() > 0
    }

    async fn cache_locally(&self, snapshot: &ServerSnapshot) {
        if let Err(e) = self
            .storage
            .save(PLANNER_DATA_KEY, snapshot, StoragePriority::Normal)
            .await
        {
            warn!("failed to cache snapshot locally: {}", e);
        }
    }
}

impl Drop for SyncRoleController {
    fn drop(&mut self) {
        self.stop_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CellId, Container, FieldId, FieldKind, GridSurface, MemoryGateway, MemoryStore,
        Notification, ReentrancyFlag, SyncError,
    };

    struct Fixture {
        controller: Arc<SyncRoleController>,
        gateway: MemoryGateway,
        surface: Arc<GridSurface>,
        store: MemoryStore,
        bus: EventBus,
    }

    fn fixture() -> Fixture {
        let config = SyncConfig::default();
        let gateway = MemoryGateway::new();
        let surface = Arc::new(GridSurface::with_tiles(4, 2));
        let store = MemoryStore::new();
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
            arbiter,
            surface.clone(),
            storage,
            bus.clone(),
        ));
        Fixture {
            controller,
            gateway,
            surface,
            store,
            bus,
        }
    }

    fn seeded(ts: i64, aircraft: &str) -> ServerSnapshot {
        ServerSnapshot::new(
            vec![TileState::new(CellId(3)).with_field(FieldKind::Aircraft, aircraft)],
            Timestamp(ts),
        )
    }

    fn aircraft(cell: u32) -> FieldId {
        FieldId::new(FieldKind::Aircraft, CellId(cell))
    }

    #[tokio::test(start_paused = true)]
    async fn test_entering_sync_polls_immediately() {
        let f = fixture();
        f.gateway.seed(seeded(1_000, "D-ABCD"));

        let role = f.controller.update_sync_mode(true, false).await;
        assert_eq!(role, SyncRole::Sync);
        assert_eq!(f.gateway.load_count(), 1);
        assert_eq!(f.surface.read(&aircraft(3)).as_deref(), Some("D-ABCD"));
        assert!(f.controller.has_poll_timer());
        assert!(!f.controller.has_push_timer());
        assert!(f.store.peek(PLANNER_DATA_KEY).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_standalone_cancels_timers() {
        let f = fixture();
        f.controller.update_sync_mode(true, true).await;
        assert!(f.controller.has_poll_timer());
        assert!(f.controller.has_push_timer());

        f.controller.update_sync_mode(false, false).await;
        assert!(!f.controller.has_poll_timer());
        assert!(!f.controller.has_push_timer());

        let probes = f.gateway.probe_count();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.gateway.probe_count(), probes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_poll_probes_before_loading() {
        let f = fixture();
        f.gateway.seed(seeded(1_000, "D-ABCD"));
        f.controller.update_sync_mode(true, false).await;
        assert_eq!(f.gateway.load_count(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(f.gateway.probe_count(), 2);
        assert_eq!(f.gateway.load_count(), 1);

        f.gateway.seed(seeded(2_000, "D-WXYZ"));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.gateway.load_count(), 2);
        assert_eq!(f.surface.read(&aircraft(3)).as_deref(), Some("D-WXYZ"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_keeps_local_values() {
        let f = fixture();
        f.surface
            .write(Container::Primary, &aircraft(1), "LOCAL")
            .unwrap();
        f.gateway.seed(seeded(1_000, "D-ABCD"));
        f.gateway.fail_loads(true);

        f.controller.update_sync_mode(true, false).await;
        let result = f.controller.poll_now().await;
        assert!(matches!(result, Err(SyncError::Network(_))));
        assert_eq!(f.surface.read(&aircraft(1)).as_deref(), Some("LOCAL"));
        assert_eq!(f.controller.role(), SyncRole::Sync);
    }

    fn notices(events: &mut tokio::sync::broadcast::Receiver<UiEvent>) -> Vec<Notification> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let UiEvent::Notification(n) = event {
                seen.push(n);
            }
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_entering_sync_announces_loaded_data() {
        let f = fixture();
        let mut events = f.bus.subscribe();
        f.gateway.seed(seeded(1_000, "D-ABCD"));

        f.controller.update_sync_mode(true, false).await;
        let seen = notices(&mut events);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, NotificationLevel::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_warns_once_per_outage() {
        let f = fixture();
        let mut events = f.bus.subscribe();
        f.gateway.seed(seeded(1_000, "D-ABCD"));
        f.gateway.fail_loads(true);

        f.controller.update_sync_mode(true, false).await;
        assert!(f.controller.poll_now().await.is_err());
        tokio::time::sleep(Duration::from_secs(95)).await;

        let seen = notices(&mut events);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, NotificationLevel::Warning);
        assert!(seen[0].message.contains("connection refused"));

        f.gateway.fail_loads(false);
        f.controller.poll_now().await.unwrap();
        let seen = notices(&mut events);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, NotificationLevel::Info);
        assert_eq!(f.surface.read(&aircraft(3)).as_deref(), Some("D-ABCD"));

        // Re-entering a reading role reports a failure again.
        f.gateway.fail_loads(true);
        f.controller.update_sync_mode(false, false).await;
        f.controller.update_sync_mode(true, false).await;
        assert!(notices(&mut events)
            .iter()
            .any(|n| n.level == NotificationLevel::Warning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_push_detects_changes() {
        let f = fixture();
        f.controller.update_sync_mode(true, true).await;

        assert!(matches!(
            f.controller.push_now().await.unwrap(),
            PushOutcome::Saved(_)
        ));
        assert_eq!(f.controller.push_now().await.unwrap(), PushOutcome::Unchanged);
        assert_eq!(f.gateway.save_count(), 1);

        f.surface
            .write(Container::Primary, &aircraft(2), "D-EFGH")
            .unwrap();
        f.controller.push_now().await.unwrap();
        assert_eq!(f.gateway.save_count(), 2);
        let stored = f.gateway.current().unwrap();
        assert_eq!(
            stored.tile(CellId(2)).unwrap().aircraft_id.as_deref(),
            Some("D-EFGH")
        );
        // Own write is not re-applied on the next poll.
        assert_eq!(
            f.controller.poll_now().await.unwrap(),
            PollOutcome::Unchanged
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_preflight_pull_merges_newer_server_data() {
        let f = fixture();
        f.controller.update_sync_mode(true, true).await;

        f.gateway.seed(seeded(Timestamp::now().0 + 60_000, "D-REMOTE"));
        f.surface
            .write(Container::Primary, &aircraft(1), "D-LOCAL")
            .unwrap();

        f.controller.push_now().await.unwrap();
        let stored = f.gateway.current().unwrap();
        assert_eq!(
            stored.tile(CellId(3)).unwrap().aircraft_id.as_deref(),
            Some("D-REMOTE")
        );
        assert_eq!(
            stored.tile(CellId(1)).unwrap().aircraft_id.as_deref(),
            Some("D-LOCAL")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_notifies_and_retries() {
        let f = fixture();
        let mut events = f.bus.subscribe();
        f.controller.update_sync_mode(true, true).await;
        f.gateway.fail_saves(true);

        assert!(f.controller.push_now().await.is_err());
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let UiEvent::Notification(n) = event {
                saw_error |= n.level == NotificationLevel::Error;
            }
        }
        assert!(saw_error);

        f.gateway.fail_saves(false);
        f.controller.schedule_push(Duration::from_millis(450));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(f.gateway.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_role_never_saves() {
        let f = fixture();
        f.controller.update_sync_mode(true, false).await;
        f.surface
            .write(Container::Primary, &aircraft(1), "D-NOPE")
            .unwrap();

        assert_eq!(f.controller.push_now().await.unwrap(), PushOutcome::Skipped);
        f.controller.schedule_push(Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.gateway.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_and_resume_reads() {
        let f = fixture();
        f.controller.update_sync_mode(true, false).await;
        f.controller.suspend_reads();
        assert!(!f.controller.has_poll_timer());
        assert_eq!(f.controller.poll_now().await.unwrap(), PollOutcome::Skipped);

        f.gateway.seed(seeded(5_000, "D-BACK"));
        f.controller.resume_reads(true).await;
        assert!(f.controller.has_poll_timer());
        assert_eq!(f.surface.read(&aircraft(3)).as_deref(), Some("D-BACK"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_saved_role_is_restored() {
        let f = fixture();
        f.controller.update_sync_mode(true, true).await;
        let saved: SyncSettings =
            serde_json::from_str(&f.store.peek(SYNC_SETTINGS_KEY).unwrap()).unwrap();
        assert_eq!(saved.role, SyncRole::Master);

        let g = fixture();
        g.store.put(SYNC_SETTINGS_KEY, f.store.peek(SYNC_SETTINGS_KEY).unwrap());
        assert_eq!(g.controller.restore_saved_role().await, SyncRole::Master);
    }
}

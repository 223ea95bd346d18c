/// Field change aggregator: validates, debounces and commits field edits
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::{
    canonicalize_datetime, capture_tiles, ConflictArbiter, Container, FieldId, FieldSurface,
    HistoryManager, KeyedDebouncer, RoleHandle, ServerSnapshot, StoragePriority, StorageQueue,
    SyncConfig, SyncRole, SyncRoleController, TileState, PLANNER_DATA_KEY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldEventKind {
    /// A keystroke; the user is still typing.
    Input,
    /// Focus left the field.
    Blur,
    /// A select or picker committed a value.
    Change,
}

/// One delegated UI event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEvent {
    /// Element id as rendered, e.g. `arrival-time-12`.
    pub target_id: String,
    pub value: String,
    pub kind: FieldEventKind,
    /// Container the element was observed in, when the host knows it.
    pub container: Option<Container>,
}

impl FieldEvent {
    pub fn new(target_id: impl Into<String>, value: impl Into<String>, kind: FieldEventKind) -> Self {
        Self {
            target_id: target_id.into(),
            value: value.into(),
            kind,
            container: None,
        }
    }

    pub fn in_container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// Server data or a history restore is being applied.
    Suppressed,
    /// Not one of the tracked field patterns.
    NotTracked,
    /// The client is a read-only follower.
    ReadOnly,
    /// The element lives in the other container; dropped.
    ContainerMismatch,
    /// Written and waiting for its debounce.
    Scheduled(FieldId),
}

/// Durations the aggregator works with.
#[derive(Debug, Clone, Copy)]
struct Delays {
    input: Duration,
    commit: Duration,
    typing_flush: Duration,
    push: Duration,
}

pub struct FieldChangeAggregator {
    surface: Arc<dyn FieldSurface>,
    arbiter: Arc<ConflictArbiter>,
    history: Arc<HistoryManager>,
    controller: Arc<SyncRoleController>,
    storage: Arc<StorageQueue>,
    role: RoleHandle,
    delays: Delays,
    debouncer: KeyedDebouncer<FieldId>,
    /// Fields edited but not yet committed in the current capture window.
    uncommitted: Mutex<HashSet<FieldId>>,
    /// State before the first edit of the current capture window.
    window_start: Mutex<Option<Vec<TileState>>>,
}

impl FieldChangeAggregator {
    pub fn new(
        config: &SyncConfig,
        surface: Arc<dyn FieldSurface>,
        arbiter: Arc<ConflictArbiter>,
        history: Arc<HistoryManager>,
        controller: Arc<SyncRoleController>,
        storage: Arc<StorageQueue>,
    ) -> Self {
        let role = controller.role_handle();
        Self {
            surface,
            arbiter,
            history,
            controller,
            storage,
            role,
            delays: Delays {
                input: config.input_debounce(),
                commit: config.commit_debounce(),
                typing_flush: config.typing_flush_delay(),
                push: config.push_debounce(),
            },
            debouncer: KeyedDebouncer::new(),
            uncommitted: Mutex::new(HashSet::new()),
            window_start: Mutex::new(None),
        }
    }

    /// Fields waiting for their debounce to fire.
    pub fn pending_commits(&self) -> usize {
        self.uncommitted.lock().len()
    }

    pub fn handle(self: &Arc<Self>, event: FieldEvent) -> EventDisposition {
        if self.arbiter.is_applying() || self.history.restore_guard().is_active() {
            return EventDisposition::Suppressed;
        }

        let field: FieldId = match event.target_id.parse() {
            Ok(field) => field,
            Err(_) => return EventDisposition::NotTracked,
        };

        if self.role.current() == SyncRole::Sync {
            debug!("edit to {} dropped: read-only mode", field);
            return EventDisposition::ReadOnly;
        }

        let Some(found) = event.container.or_else(|| self.surface.locate(&field)) else {
            warn!("edit to {} dropped: element not rendered", field);
            return EventDisposition::NotTracked;
        };
        let expected = field.container();
        if found != expected {
            error!(
                "edit to {} dropped: element found in {} but belongs to {}",
                field, found, expected
            );
            return EventDisposition::ContainerMismatch;
        }

        {
            let mut window = self.window_start.lock();
            if window.is_none() {
                *window = Some(capture_tiles(self.surface.as_ref()));
            }
        }
        if let Err(e) = self.surface.write(expected, &field, &event.value) {
            error!("edit to {} not applied: {}", field, e);
            return EventDisposition::NotTracked;
        }
        if self.role.current().can_write() {
            self.arbiter.mark_pending_write(field);
        }
        self.uncommitted.lock().insert(field);

        let delay = match event.kind {
            FieldEventKind::Input => self.delays.input,
            FieldEventKind::Blur | FieldEventKind::Change => self.delays.commit,
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let kind = event.kind;
        self.debouncer.schedule(field, delay, async move {
            if let Some(aggregator) = weak.upgrade() {
                aggregator.commit(field, kind).await;
            }
        });
        EventDisposition::Scheduled(field)
    }

    /// Debounced commit of one field: canonicalize, cache locally, close the
    /// capture window once every edited field is committed, schedule the push.
    async fn commit(&self, field: FieldId, kind: FieldEventKind) {
        let role = self.role.current();
        if role == SyncRole::Sync {
            let mut uncommitted = self.uncommitted.lock();
            uncommitted.remove(&field);
            if uncommitted.is_empty() {
                self.window_start.lock().take();
            }
            return;
        }

        if field.kind.is_datetime() {
            self.canonicalize(field);
        }

        let tiles = capture_tiles(self.surface.as_ref());
        let cache = ServerSnapshot::new(tiles, self.arbiter.last_applied());
        if let Err(e) = self
            .storage
            .save(PLANNER_DATA_KEY, &cache, StoragePriority::Normal)
            .await
        {
            warn!("failed to cache committed edit to {}: {}", field, e);
        }

        let closed_window = {
            let mut uncommitted = self.uncommitted.lock();
            uncommitted.remove(&field);
            if uncommitted.is_empty() {
                self.window_start.lock().take()
            } else {
                None
            }
        };
        if let Some(before) = closed_window {
            self.history.push_state(before).await;
        }

        if role.can_write() {
            self.arbiter.mark_pending_write(field);
            let delay = match kind {
                FieldEventKind::Input if field.kind.is_free_text() => self.delays.typing_flush,
                FieldEventKind::Blur | FieldEventKind::Change if field.kind.is_free_text() => {
                    Duration::ZERO
                }
                _ => self.delays.push,
            };
            self.controller.schedule_push(delay);
        }
    }

    /// Rewrite a date/time value to ISO form. Unparseable text stays as typed.
    fn canonicalize(&self, field: FieldId) {
        let Some(raw) = self.surface.read(&field) else {
            return;
        };
        if raw.trim().is_empty() {
            return;
        }
        match canonicalize_datetime(&raw) {
            Some(iso) if iso != raw => {
                if let Err(e) = self.surface.write(field.container(), &field, &iso) {
                    warn!("could not canonicalize {}: {}", field, e);
                }
            }
            Some(_) => {}
            None => debug!("{} keeps unparsed value {:?}", field, raw),
        }
    }
}

/// Conflict & merge arbiter: accepts or discards inbound snapshots by timestamp
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::{
    apply_tile_writes, plan_tile_writes, FieldId, FieldSurface, MissingElement, ReentrancyFlag,
    Result, ServerSnapshot, SyncError, Timestamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        timestamp: Timestamp,
        fields_written: usize,
    },
    /// Older than or equal to what this client already holds. Not an error.
    Discarded {
        incoming: Timestamp,
        last_applied: Timestamp,
    },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, Copy)]
enum Fence {
    /// Edited locally and not yet carried by an acknowledged push.
    Pending(u64),
    /// Pushed; shielded until the instant passes.
    Until(Instant),
}

impl Fence {
    fn holds(&self, now: Instant) -> bool {
        match self {
            Fence::Pending(_) => true,
            Fence::Until(until) => *until > now,
        }
    }
}

#[derive(Debug, Default)]
struct ArbiterState {
    last_applied: Timestamp,
    fences: HashMap<FieldId, Fence>,
    /// Bumped on every local write mark.
    generation: u64,
}

pub struct ConflictArbiter {
    surface: Arc<dyn FieldSurface>,
    applying: ReentrancyFlag,
    fence: Duration,
    state: Mutex<ArbiterState>,
}

impl ConflictArbiter {
    pub fn new(surface: Arc<dyn FieldSurface>, applying: ReentrancyFlag, fence: Duration) -> Self {
        Self {
            surface,
            applying,
            fence,
            state: Mutex::new(ArbiterState::default()),
        }
    }

    /// Apply `snapshot` if it is newer than the last applied one.
    ///
    /// Writes happen under the apply guard and without any suspension point.
    /// A container mismatch aborts before the first write.
    pub fn apply(&self, snapshot: &ServerSnapshot) -> Result<ApplyOutcome> {
        let incoming = snapshot.timestamp();
        let mut state = self.state.lock();

        if incoming <= state.last_applied {
            debug!(
                "discarding stale snapshot {} (last applied {})",
                incoming, state.last_applied
            );
            return Ok(ApplyOutcome::Discarded {
                incoming,
                last_applied: state.last_applied,
            });
        }

        let now = Instant::now();
        state.fences.retain(|_, fence| fence.holds(now));
        let fences = &state.fences;

        let plan = plan_tile_writes(
            self.surface.as_ref(),
            &snapshot.tiles,
            MissingElement::Skip,
            |field| fences.contains_key(field),
        )
        .map_err(|e| {
            if let SyncError::ContainerMismatch { .. } = &e {
                error!("snapshot {} not applied: {}", incoming, e);
            }
            e
        })?;

        let fields_written = {
            let _guard = self.applying.acquire();
            apply_tile_writes(self.surface.as_ref(), &plan)?
        };

        state.last_applied = incoming;
        debug!("applied snapshot {} ({} fields)", incoming, fields_written);
        Ok(ApplyOutcome::Applied {
            timestamp: incoming,
            fields_written,
        })
    }

    /// Record that this client's own write was acknowledged at `timestamp`.
    pub fn note_local_write(&self, timestamp: Timestamp) {
        let mut state = self.state.lock();
        state.last_applied = state.last_applied.max(timestamp);
    }

    /// Shield `field` from inbound values until a push carrying it is
    /// acknowledged, then for the fence duration.
    pub fn mark_pending_write(&self, field: FieldId) {
        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        state.fences.insert(field, Fence::Pending(generation));
    }

    /// Marker to pass to [`release_pending_writes`](Self::release_pending_writes)
    /// once the tiles captured after this call are acknowledged.
    pub fn pending_generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Start the fence timeout of every write marked up to `generation`.
    pub fn release_pending_writes(&self, generation: u64) {
        let until = Instant::now() + self.fence;
        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            if matches!(fence, Fence::Pending(marked) if *marked <= generation) {
                *fence = Fence::Until(until);
            }
        }
    }

    /// Leaving master: nothing pending will be pushed any more.
    pub fn clear_pending_writes(&self) {
        self.release_pending_writes(u64::MAX);
    }

    pub fn has_pending_writes(&self) -> bool {
        self.state
            .lock()
            .fences
            .values()
            .any(|fence| matches!(fence, Fence::Pending(_)))
    }

    pub fn is_fenced(&self, field: &FieldId) -> bool {
        self.state
            .lock()
            .fences
            .get(field)
            .is_some_and(|fence| fence.holds(Instant::now()))
    }

    pub fn last_applied(&self) -> Timestamp {
        self.state.lock().last_applied
    }

    pub fn is_applying(&self) -> bool {
        self.applying.is_active()
    }
}

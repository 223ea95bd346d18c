/// Events announced to the presentation layer
/// The core never renders; it mutates canonical field values and tells listeners it did.
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{SyncRole, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Transient, auto-dismissing user notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryDirection {
    Undo,
    Redo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    /// The arbiter accepted a server snapshot.
    ServerDataApplied {
        timestamp: Timestamp,
        fields_written: usize,
    },

    /// An undo or redo restored tile values.
    HistoryRestored { direction: HistoryDirection },

    /// Undo/redo availability changed (button state).
    HistoryChanged { can_undo: bool, can_redo: bool },

    SyncModeChanged { role: SyncRole },

    Notification(Notification),
}

/// Broadcast channel of [`UiEvent`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UiEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            debug!("ui event dropped: no listeners");
        }
    }

    /// Log the notice and announce it as a toast.
    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NotificationLevel::Info | NotificationLevel::Success => info!("{}", message),
            NotificationLevel::Warning => warn!("{}", message),
            NotificationLevel::Error => error!("{}", message),
        }
        self.emit(UiEvent::Notification(Notification { level, message }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

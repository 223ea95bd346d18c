use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Synchronization role of one client instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRole {
    /// No network interaction.
    #[default]
    Standalone,
    /// Read-only follower: polls, never writes.
    Sync,
    /// Read-write leader: polls and writes.
    Master,
}

impl SyncRole {
    /// Combine the "read" and "write" toggles. Write without read is
    /// normalized to master, which always reads back.
    pub fn from_toggles(read: bool, write: bool) -> Self {
        match (read, write) {
            (false, false) => SyncRole::Standalone,
            (true, false) => SyncRole::Sync,
            (_, true) => SyncRole::Master,
        }
    }

    pub fn can_read(self) -> bool {
        !matches!(self, SyncRole::Standalone)
    }

    pub fn can_write(self) -> bool {
        matches!(self, SyncRole::Master)
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, SyncRole::Sync)
    }
}

impl fmt::Display for SyncRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncRole::Standalone => "standalone",
            SyncRole::Sync => "sync",
            SyncRole::Master => "master",
        };
        f.write_str(name)
    }
}

/// Read side of the current role, handed to every component that gates on it.
#[derive(Debug, Clone)]
pub struct RoleHandle(watch::Receiver<SyncRole>);

impl RoleHandle {
    pub fn current(&self) -> SyncRole {
        *self.0.borrow()
    }

    /// Resolves on the next role change.
    pub async fn changed(&mut self) -> Option<SyncRole> {
        self.0.changed().await.ok()?;
        Some(*self.0.borrow_and_update())
    }
}

/// Owner of the role value. Only the sync role controller holds one.
#[derive(Debug)]
pub struct RoleCell(watch::Sender<SyncRole>);

impl RoleCell {
    pub fn new(initial: SyncRole) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self(tx)
    }

    pub fn get(&self) -> SyncRole {
        *self.0.borrow()
    }

    /// Returns the previous role.
    pub fn set(&self, role: SyncRole) -> SyncRole {
        self.0.send_replace(role)
    }

    pub fn handle(&self) -> RoleHandle {
        RoleHandle(self.0.subscribe())
    }
}

//! Multi-client synchronization core for the hangar tile planner.
//!
//! A client runs in one of three roles (standalone, read-only follower,
//! read-write master), polls a shared JSON snapshot, arbitrates inbound
//! snapshots by timestamp, keeps a bounded undo/redo history and debounces
//! field edits before committing them locally and to the server.
use thiserror::Error;

mod aggregator;
mod arbiter;
mod client;
mod config;
mod controller;
mod events;
mod gateway;
mod guard;
mod history;
mod model;
mod role;
mod shortcuts;
mod storage;
mod surface;
mod timer;

pub use aggregator::*;
pub use arbiter::*;
pub use client::*;
pub use config::*;
pub use controller::*;
pub use events::*;
pub use gateway::*;
pub use guard::*;
pub use history::*;
pub use model::*;
pub use role::*;
pub use shortcuts::*;
pub use storage::*;
pub use surface::*;
pub use timer::*;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),

    #[error("save rejected by server: {0}")]
    SaveRejected(String),

    #[error("field {field} belongs to {expected} but its element lives in {found}")]
    ContainerMismatch {
        field: FieldId,
        expected: Container,
        found: Container,
    },

    #[error("unknown field id: {0}")]
    UnknownField(String),

    #[error("element not found: {0}")]
    ElementMissing(FieldId),

    #[error("history restore failed: {0}")]
    HistoryRestore(String),

    #[error("invalid persisted JSON under key {key}: {reason}")]
    InvalidPersistedJson { key: String, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Single-document JSON storage for the shared hangar snapshot
/// The document is kept in memory and mirrored to one file on every accepted write.
use hangar_sync::Timestamp;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The data file exists but does not hold a JSON object.
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),

    /// A write body that is not a JSON object.
    #[error("snapshot must be a JSON object")]
    NotAnObject,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
enum Document {
    Empty,
    Corrupt(String),
    Stored {
        value: Value,
        timestamp: Timestamp,
        size: u64,
    },
}

pub struct SnapshotStore {
    path: PathBuf,
    document: RwLock<Document>,
}

impl SnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let document = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) if value.is_object() => {
                    let timestamp = stamp_of(&value);
                    info!("Loaded snapshot {} from {}", timestamp, path.display());
                    Document::Stored {
                        value,
                        timestamp,
                        size: raw.len() as u64,
                    }
                }
                Ok(_) => Document::Corrupt("top-level value is not an object".to_string()),
                Err(e) => {
                    warn!("Data file {} is not valid JSON: {}", path.display(), e);
                    Document::Corrupt(e.to_string())
                }
            }
        } else {
            Document::Empty
        };

        Ok(Self {
            path,
            document: RwLock::new(document),
        })
    }

    /// The stored document, `None` before the first write.
    pub fn load(&self) -> Result<Option<Value>, StoreError> {
        match &*self.document.read() {
            Document::Empty => Ok(None),
            Document::Corrupt(e) => Err(StoreError::Corrupt(e.clone())),
            Document::Stored { value, .. } => Ok(Some(value.clone())),
        }
    }

    /// Timestamp and byte size of the stored document.
    pub fn probe(&self) -> Option<(Timestamp, u64)> {
        match &*self.document.read() {
            Document::Stored {
                timestamp, size, ..
            } => Some((*timestamp, *size)),
            _ => None,
        }
    }

    /// Replace the document. The accepted timestamp is the wall clock, or one
    /// past the previous timestamp if the clock lags behind it.
    pub fn save(&self, mut value: Value) -> Result<(Timestamp, u64), StoreError> {
        let Some(object) = value.as_object_mut() else {
            return Err(StoreError::NotAnObject);
        };

        let mut document = self.document.write();
        let previous = match &*document {
            Document::Stored { timestamp, .. } => Some(*timestamp),
            _ => None,
        };
        let timestamp = Timestamp::next_after(previous);

        let metadata = object
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        if let Value::Object(metadata) = metadata {
            metadata.insert("timestamp".to_string(), Value::from(timestamp.as_millis()));
        }

        let raw = serde_json::to_string(&value)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &raw)?;
        fs::rename(&tmp, &self.path)?;

        let size = raw.len() as u64;
        *document = Document::Stored {
            value,
            timestamp,
            size,
        };
        Ok((timestamp, size))
    }
}

fn stamp_of(value: &Value) -> Timestamp {
    value
        .pointer("/metadata/timestamp")
        .and_then(Value::as_i64)
        .map(Timestamp)
        .unwrap_or(Timestamp::ZERO)
}

/// Persistence gateway: load/save of the one shared snapshot plus a cheap timestamp probe
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Result, ServerSnapshot, SyncConfig, SyncError, Timestamp};

pub const ROLE_HEADER: &str = "X-Sync-Role";
pub const SESSION_HEADER: &str = "X-Sync-Session";
pub const DISPLAY_NAME_HEADER: &str = "X-Display-Name";

/// Acknowledgement of an accepted save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveAck {
    pub timestamp: Timestamp,
}

/// Body of every save answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `?action=timestamp`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimestampResponse {
    pub timestamp: Timestamp,
    #[serde(default)]
    pub size: u64,
    pub success: bool,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Full snapshot, or `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<ServerSnapshot>>;

    /// Replace the shared snapshot. The server assigns the timestamp.
    async fn save(&self, snapshot: &ServerSnapshot) -> Result<SaveAck>;

    /// Timestamp of the stored snapshot (`Timestamp::ZERO` when empty).
    async fn timestamp(&self) -> Result<Timestamp>;
}

/// Gateway speaking to the shared HTTP endpoint.
pub struct HttpGateway {
    endpoint: String,
    session_id: Uuid,
    display_name: Option<String>,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hangar-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            session_id: Uuid::new_v4(),
            display_name: config.display_name.clone(),
            client,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

#[async_trait]
impl PersistenceGateway for HttpGateway {
    async fn load(&self) -> Result<Option<ServerSnapshot>> {
        let response = self.client.get(&self.endpoint).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("no shared snapshot stored yet");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SyncError::Network(format!(
                "load failed with status {}",
                response.status()
            )));
        }

        let snapshot: ServerSnapshot = response.json().await?;
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &ServerSnapshot) -> Result<SaveAck> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(ROLE_HEADER, "master")
            .header(SESSION_HEADER, self.session_id.to_string())
            .json(snapshot);
        if let Some(name) = &self.display_name {
            request = request.header(DISPLAY_NAME_HEADER, name);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(SyncError::Network(format!("save failed with status {}", status)));
        }

        let body: SaveResponse = response.json().await.map_err(|e| {
            SyncError::Network(format!("unreadable save response ({}): {}", status, e))
        })?;
        if !status.is_success() || !body.success {
            let reason = body.error.unwrap_or_else(|| format!("status {}", status));
            warn!("server rejected save: {}", reason);
            return Err(SyncError::SaveRejected(reason));
        }

        let timestamp = body.timestamp.ok_or_else(|| {
            SyncError::SaveRejected("acknowledgement without timestamp".to_string())
        })?;
        Ok(SaveAck { timestamp })
    }

    async fn timestamp(&self) -> Result<Timestamp> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("action", "timestamp")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::Network(format!(
                "timestamp probe failed with status {}",
                response.status()
            )));
        }

        let body: TimestampResponse = response.json().await?;
        Ok(if body.success { body.timestamp } else { Timestamp::ZERO })
    }
}

#[derive(Debug, Default)]
struct MemoryResource {
    snapshot: Mutex<Option<ServerSnapshot>>,
    saved: Mutex<Vec<ServerSnapshot>>,
    loads: AtomicUsize,
    probes: AtomicUsize,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

/// In-process shared resource. Clones share state, so several clients can
/// talk to one `MemoryGateway`.
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    inner: Arc<MemoryResource>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the resource as if another master had written `snapshot` verbatim.
    pub fn seed(&self, snapshot: ServerSnapshot) {
        *self.inner.snapshot.lock() = Some(snapshot);
    }

    pub fn current(&self) -> Option<ServerSnapshot> {
        self.inner.snapshot.lock().clone()
    }

    /// Every snapshot accepted by `save`, oldest first.
    pub fn saved(&self) -> Vec<ServerSnapshot> {
        self.inner.saved.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.inner.saved.lock().len()
    }

    pub fn load_count(&self) -> usize {
        self.inner.loads.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.inner.probes.load(Ordering::SeqCst)
    }

    pub fn fail_loads(&self, fail: bool) {
        self.inner.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.inner.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn load(&self) -> Result<Option<ServerSnapshot>> {
        self.inner.loads.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_loads.load(Ordering::SeqCst) {
            return Err(SyncError::Network("connection refused".to_string()));
        }
        Ok(self.current())
    }

    async fn save(&self, snapshot: &ServerSnapshot) -> Result<SaveAck> {
        if self.inner.fail_saves.load(Ordering::SeqCst) {
            return Err(SyncError::Network("connection refused".to_string()));
        }

        let mut stored = self.inner.snapshot.lock();
        let previous = stored.as_ref().map(ServerSnapshot::timestamp);
        let timestamp = Timestamp::next_after(previous);

        let mut accepted = snapshot.clone();
        accepted.metadata.timestamp = timestamp;
        self.inner.saved.lock().push(accepted.clone());
        *stored = Some(accepted);
        Ok(SaveAck { timestamp })
    }

    async fn timestamp(&self) -> Result<Timestamp> {
        self.inner.probes.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_loads.load(Ordering::SeqCst) {
            return Err(SyncError::Network("connection refused".to_string()));
        }
        Ok(self
            .current()
            .map(|snapshot| snapshot.timestamp())
            .unwrap_or(Timestamp::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CellId, FieldKind, TileState};

    #[tokio::test]
    async fn test_memory_gateway_assigns_increasing_timestamps() {
        let gateway = MemoryGateway::new();
        assert!(gateway.load().await.unwrap().is_none());
        assert_eq!(gateway.timestamp().await.unwrap(), Timestamp::ZERO);

        let tiles = vec![TileState::new(CellId(3)).with_field(FieldKind::Aircraft, "D-ABCD")];
        let first = gateway
            .save(&ServerSnapshot::new(tiles.clone(), Timestamp::ZERO))
            .await
            .unwrap();
        let second = gateway
            .save(&ServerSnapshot::new(tiles, Timestamp::ZERO))
            .await
            .unwrap();

        assert!(second.timestamp > first.timestamp);
        assert_eq!(gateway.timestamp().await.unwrap(), second.timestamp);
        assert_eq!(gateway.save_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_gateway_failure_injection() {
        let gateway = MemoryGateway::new();
        gateway.fail_loads(true);
        assert!(matches!(gateway.load().await, Err(SyncError::Network(_))));
        assert!(gateway.timestamp().await.is_err());

        gateway.fail_saves(true);
        let result = gateway.save(&ServerSnapshot::default()).await;
        assert!(result.is_err());
        assert_eq!(gateway.save_count(), 0);
    }

    #[test]
    fn test_save_response_wire_shape() {
        let body: SaveResponse =
            serde_json::from_str(r#"{"success":false,"error":"Only master may write"}"#).unwrap();
        assert!(!body.success);
        assert_eq!(body.error.as_deref(), Some("Only master may write"));

        let probe: TimestampResponse =
            serde_json::from_str(r#"{"timestamp":1700000000123,"size":512,"success":true}"#)
                .unwrap();
        assert_eq!(probe.timestamp, Timestamp(1_700_000_000_123));
    }
}

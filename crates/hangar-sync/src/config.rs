use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Result, SyncError};

/// Tunables of one client. Durations are milliseconds in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// URL of the shared snapshot resource.
    pub endpoint: String,

    /// Recurring poll while in sync or master role.
    pub poll_interval_ms: u64,

    /// Master change-detection push.
    pub push_interval_ms: u64,

    /// Local commit delay while typing.
    pub input_debounce_ms: u64,

    /// Server flush delay while typing into free-text fields.
    pub typing_flush_delay_ms: u64,

    /// Local commit delay after blur/change.
    pub commit_debounce_ms: u64,

    /// Trailing delay that batches committed fields into one push.
    pub push_debounce_ms: u64,

    /// How long a locally committed field ignores inbound server values.
    pub write_fence_ms: u64,

    pub history_limit: usize,

    /// Pause between local storage operations.
    pub storage_pause_ms: u64,

    pub request_timeout_ms: u64,

    /// Sent as `X-Display-Name` and recorded as last writer.
    pub display_name: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/sync/data".to_string(),
            poll_interval_ms: 30_000,
            push_interval_ms: 5_000,
            input_debounce_ms: 500,
            typing_flush_delay_ms: 2_000,
            commit_debounce_ms: 150,
            push_debounce_ms: 450,
            write_fence_ms: 1_200,
            history_limit: 5,
            storage_pause_ms: 10,
            request_timeout_ms: 10_000,
            display_name: None,
        }
    }
}

impl SyncConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        let config: SyncConfig = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(SyncError::Config("endpoint must not be empty".to_string()));
        }
        if self.poll_interval_ms == 0 || self.push_interval_ms == 0 {
            return Err(SyncError::Config(
                "poll and push intervals must be positive".to_string(),
            ));
        }
        if self.history_limit == 0 {
            return Err(SyncError::Config(
                "history_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms)
    }

    pub fn input_debounce(&self) -> Duration {
        Duration::from_millis(self.input_debounce_ms)
    }

    pub fn typing_flush_delay(&self) -> Duration {
        Duration::from_millis(self.typing_flush_delay_ms)
    }

    pub fn commit_debounce(&self) -> Duration {
        Duration::from_millis(self.commit_debounce_ms)
    }

    pub fn push_debounce(&self) -> Duration {
        Duration::from_millis(self.push_debounce_ms)
    }

    pub fn write_fence(&self) -> Duration {
        Duration::from_millis(self.write_fence_ms)
    }

    pub fn storage_pause(&self) -> Duration {
        Duration::from_millis(self.storage_pause_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"endpoint": "https://hangar.example/sync/data.php", "poll_interval_ms": 10000}}"#
        )
        .unwrap();

        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.endpoint, "https://hangar.example/sync/data.php");
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.history_limit, 5);
        assert_eq!(config.write_fence(), Duration::from_millis(1200));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = SyncConfig {
            history_limit: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let config = SyncConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

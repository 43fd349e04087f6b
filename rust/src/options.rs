use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const OPTIONS_FILE_NAME: &str = "pika_relay.json";

/// Pool tunables. Every field is optional in `pika_relay.json`; missing
/// fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Connect attempts that are not open by then are forced to `Error`.
    pub connect_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed reconnects before a relay is left disconnected.
    pub max_reconnect_attempts: u32,
    /// A session that stays open this long clears the reconnect count.
    /// Shorter sessions count as failures.
    pub reconnect_stable_after_ms: u64,
    pub query_max_wait_ms: u64,
    pub publish_timeout_ms: u64,
    /// Event ids remembered per long-lived subscription for deduplication.
    pub seen_cache_capacity: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            reconnect_stable_after_ms: 60_000,
            query_max_wait_ms: 8_000,
            publish_timeout_ms: 10_000,
            seen_cache_capacity: 4_096,
        }
    }
}

impl PoolOptions {
    /// Read `path`, falling back to defaults when it is missing or unreadable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let Ok(bytes) = std::fs::read(path) else {
            return Self::default();
        };
        match serde_json::from_slice::<Self>(&bytes) {
            Ok(options) => options,
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring malformed pool options: {e}");
                Self::default()
            }
        }
    }

    /// [`PoolOptions::load`] on `<data_dir>/pika_relay.json`.
    pub fn load_from_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::load(data_dir.as_ref().join(OPTIONS_FILE_NAME))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn reconnect_stable_after(&self) -> Duration {
        Duration::from_millis(self.reconnect_stable_after_ms)
    }

    pub fn query_max_wait(&self) -> Duration {
        Duration::from_millis(self.query_max_wait_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reconnect_schedule() {
        let o = PoolOptions::default();
        assert_eq!(o.connect_timeout(), Duration::from_secs(10));
        assert_eq!(o.reconnect_base_delay(), Duration::from_secs(1));
        assert_eq!(o.reconnect_max_delay(), Duration::from_secs(30));
        assert_eq!(o.max_reconnect_attempts, 5);
        assert_eq!(o.reconnect_stable_after(), Duration::from_secs(60));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PoolOptions::load_from_dir(dir.path()), PoolOptions::default());
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(OPTIONS_FILE_NAME),
            r#"{"query_max_wait_ms": 250, "seen_cache_capacity": 16}"#,
        )
        .unwrap();
        let o = PoolOptions::load_from_dir(dir.path());
        assert_eq!(o.query_max_wait(), Duration::from_millis(250));
        assert_eq!(o.seen_cache_capacity, 16);
        assert_eq!(o.connect_timeout_ms, 10_000);
    }

    #[test]
    fn malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(OPTIONS_FILE_NAME), "{not json").unwrap();
        assert_eq!(PoolOptions::load_from_dir(dir.path()), PoolOptions::default());
    }
}

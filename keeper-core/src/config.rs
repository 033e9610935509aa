use crate::{ExponentialBackoffRetry, KeeperError, KeeperResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeout value meaning "leave it to the service".
pub const USE_SERVICE_DEFAULT: i64 = -1;

/// How long operations wait for a connection when no timeout is configured.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeeperConfig {
    /// Comma-separated `host:port` list of the coordination ensemble
    pub address: String,
    /// Requested session timeout; negative means service default
    pub session_timeout_ms: i64,
    /// How long to wait for a connection; negative means service default
    pub connection_timeout_ms: i64,
    pub max_retries: u32,
    pub base_sleep_time_ms: u64,
    pub max_sleep_ms: u64,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2181".to_string(),
            session_timeout_ms: USE_SERVICE_DEFAULT,
            connection_timeout_ms: USE_SERVICE_DEFAULT,
            max_retries: 3,
            base_sleep_time_ms: 1000,
            max_sleep_ms: 30_000,
        }
    }
}

impl KeeperConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> KeeperResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| KeeperError::Config(format!("invalid keeper config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KeeperResult<()> {
        if self.address.trim().is_empty() {
            return Err(KeeperError::Config("address cannot be empty".into()));
        }
        if self.base_sleep_time_ms == 0 {
            return Err(KeeperError::Config(
                "baseSleepTimeMs must be greater than zero".into(),
            ));
        }
        if self.max_sleep_ms < self.base_sleep_time_ms {
            return Err(KeeperError::Config(
                "maxSleepMs must not be smaller than baseSleepTimeMs".into(),
            ));
        }
        Ok(())
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_ms = timeout.as_millis() as i64;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = timeout.as_millis() as i64;
        self
    }

    pub fn with_retry(mut self, base_sleep: Duration, max_retries: u32) -> Self {
        self.base_sleep_time_ms = base_sleep.as_millis() as u64;
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep_ms = max_sleep.as_millis() as u64;
        self
    }

    /// Requested session timeout, `None` when left to the service.
    pub fn session_timeout(&self) -> Option<Duration> {
        positive_millis(self.session_timeout_ms)
    }

    /// Configured connection timeout, `None` when left to the service.
    pub fn connection_timeout(&self) -> Option<Duration> {
        positive_millis(self.connection_timeout_ms)
    }

    pub fn effective_connection_timeout(&self) -> Duration {
        self.connection_timeout().unwrap_or(DEFAULT_CONNECTION_TIMEOUT)
    }

    pub fn retry_policy(&self) -> ExponentialBackoffRetry {
        ExponentialBackoffRetry::with_max_sleep(
            Duration::from_millis(self.base_sleep_time_ms),
            self.max_retries,
            Duration::from_millis(self.max_sleep_ms),
        )
    }
}

fn positive_millis(value: i64) -> Option<Duration> {
    if value < 0 {
        None
    } else {
        Some(Duration::from_millis(value as u64))
    }
}

//! Controller configuration.
//!
//! Every field has a default; a deployment only overrides what it needs,
//! either from a serialized document or from the environment:
//!
//! - `SNAPSHOT_CONTROLLER_SNAPSHOT_WORKERS`, `SNAPSHOT_CONTROLLER_CONTENT_WORKERS`
//! - `SNAPSHOT_CONTROLLER_RESYNC_SECS`
//! - `SNAPSHOT_CONTROLLER_OPERATION_TIMEOUT_SECS`
//! - `SNAPSHOT_CONTROLLER_CREATE_CONTENT_RETRIES`
//! - `SNAPSHOT_CONTROLLER_CREATE_CONTENT_RETRY_INTERVAL_MS`
//!
//! Durations in serialized form are milliseconds.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::backoff::ExponentialBackoff;
use crate::error::{Result, SnapshotError};
use crate::finalizer::RetryPolicy;

const ENV_PREFIX: &str = "SNAPSHOT_CONTROLLER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub snapshot_workers: usize,
    pub content_workers: usize,
    #[serde(with = "millis")]
    pub resync_period: Duration,
    /// Upper bound on every backend call.
    #[serde(with = "millis")]
    pub operation_timeout: Duration,
    /// Attempts at persisting a content after the backend cut the snapshot.
    pub create_content_retry_count: u32,
    #[serde(with = "millis")]
    pub create_content_retry_interval: Duration,
    #[serde(with = "millis")]
    pub queue_base_delay: Duration,
    #[serde(with = "millis")]
    pub queue_max_delay: Duration,
    #[serde(with = "millis")]
    pub finalizer_retry_initial: Duration,
    pub finalizer_retry_factor: f64,
    #[serde(with = "millis")]
    pub finalizer_retry_deadline: Duration,
    #[serde(with = "millis")]
    pub operation_backoff_initial: Duration,
    #[serde(with = "millis")]
    pub operation_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            snapshot_workers: 4,
            content_workers: 4,
            resync_period: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(60),
            create_content_retry_count: 5,
            create_content_retry_interval: Duration::from_secs(10),
            queue_base_delay: Duration::from_millis(5),
            queue_max_delay: Duration::from_secs(300),
            finalizer_retry_initial: Duration::from_millis(100),
            finalizer_retry_factor: 1.5,
            finalizer_retry_deadline: Duration::from_secs(30),
            operation_backoff_initial: Duration::from_millis(500),
            operation_backoff_max: Duration::from_secs(122),
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `SNAPSHOT_CONTROLLER_*` variables read through
    /// `lookup`, typically `|k| std::env::var(k).ok()`.
    pub fn from_env<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(v) = get("SNAPSHOT_WORKERS") {
            config.snapshot_workers = parse_env("SNAPSHOT_WORKERS", &v)?;
        }
        if let Some(v) = get("CONTENT_WORKERS") {
            config.content_workers = parse_env("CONTENT_WORKERS", &v)?;
        }
        if let Some(v) = get("RESYNC_SECS") {
            config.resync_period = Duration::from_secs(parse_env("RESYNC_SECS", &v)?);
        }
        if let Some(v) = get("OPERATION_TIMEOUT_SECS") {
            config.operation_timeout =
                Duration::from_secs(parse_env("OPERATION_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("CREATE_CONTENT_RETRIES") {
            config.create_content_retry_count = parse_env("CREATE_CONTENT_RETRIES", &v)?;
        }
        if let Some(v) = get("CREATE_CONTENT_RETRY_INTERVAL_MS") {
            config.create_content_retry_interval =
                Duration::from_millis(parse_env("CREATE_CONTENT_RETRY_INTERVAL_MS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_workers == 0 || self.content_workers == 0 {
            return Err(SnapshotError::InvalidArgument(
                "worker counts must be at least 1".into(),
            ));
        }
        if self.finalizer_retry_factor.is_nan() || self.finalizer_retry_factor < 1.0 {
            return Err(SnapshotError::InvalidArgument(format!(
                "finalizer_retry_factor must be >= 1, got {}",
                self.finalizer_retry_factor
            )));
        }
        if self.operation_timeout.is_zero() {
            return Err(SnapshotError::InvalidArgument(
                "operation_timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Conflict-retry policy for finalizer removal.
    pub fn finalizer_retry(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: ExponentialBackoff::new(
                self.finalizer_retry_initial,
                self.finalizer_retry_factor,
                self.finalizer_retry_deadline,
            ),
            deadline: self.finalizer_retry_deadline,
        }
    }
}

fn parse_env<T: std::str::FromStr>(suffix: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        SnapshotError::InvalidArgument(format!("invalid value {value:?} for {ENV_PREFIX}{suffix}"))
    })
}

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

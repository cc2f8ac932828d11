//! Configuration parsing for the OMX consumer runtime.
//!
//! The consumer reads its settings from a single JSON config file. All fields
//! are optional in the file; [`ConsumerConfig::default`] supplies the
//! operational defaults.
//!
//! # Example config
//!
//! ```json
//! {
//!   "consumer_name": "omx_consumer_1",
//!   "item_count_hint": 1024,
//!   "closed_status_delay_ms": 1000,
//!   "dispatch_timeout_ms": 500,
//!   "log_level": "info",
//!   "log_path": "/tmp/log"
//! }
//! ```

use serde::Deserialize;
use tracing::info;

use crate::error::OmxError;

/// Consumer runtime configuration, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Name used in log lines and error text.
    pub consumer_name: String,

    /// Initial capacity hint for the item registry.
    pub item_count_hint: usize,

    /// Delay before a deferred closed-status event fires, in milliseconds.
    ///
    /// Must be non-zero: the delay is what guarantees the registration call
    /// has returned its handle to the application before the failure
    /// callback runs.
    pub closed_status_delay_ms: u64,

    /// Delay before the synthetic login refresh is delivered to a newly
    /// registered login item, in milliseconds.
    pub login_ready_delay_ms: u64,

    /// Default wait for `dispatch()` when the caller does not pass one.
    pub dispatch_timeout_ms: u64,

    /// Maximum transport events routed per dispatch cycle.
    pub max_dispatch_batch: usize,

    /// Default log level if `RUST_LOG` is not set.
    pub log_level: String,

    /// Optional directory for daily-rotating log files.
    pub log_path: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_name: "omx_consumer".to_string(),
            item_count_hint: 1024,
            closed_status_delay_ms: 1000,
            login_ready_delay_ms: 10,
            dispatch_timeout_ms: 500,
            max_dispatch_batch: 1024,
            log_level: "info".to_string(),
            log_path: None,
        }
    }
}

impl ConsumerConfig {
    /// Validate field ranges that the engine depends on.
    pub fn validate(&self) -> Result<(), OmxError> {
        if self.closed_status_delay_ms == 0 {
            return Err(OmxError::InvalidUsage(
                "closed_status_delay_ms must be non-zero".to_string(),
            ));
        }
        if self.max_dispatch_batch == 0 {
            return Err(OmxError::InvalidUsage(
                "max_dispatch_batch must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<ConsumerConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: ConsumerConfig = serde_json::from_str(&content)?;
    config.validate()?;
    info!(
        "[config] loaded '{}' from {}",
        config.consumer_name,
        path.display()
    );
    Ok(config)
}

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Pacing of the reconnection sweep
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Pause after every server combination failed (unit: milliseconds)
    #[serde(default = "default_sweep_retry_delay_ms")]
    pub sweep_retry_delay_ms: u64,

    /// Backoff after a session connected but never became fully connected
    /// (unit: milliseconds)
    #[serde(default = "default_unsettled_backoff_ms")]
    pub unsettled_backoff_ms: u64,

    /// Yield after a failure where a handle was obtained (unit: milliseconds,
    /// 0 only reschedules)
    #[serde(default)]
    pub failure_yield_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            sweep_retry_delay_ms: default_sweep_retry_delay_ms(),
            unsettled_backoff_ms: default_unsettled_backoff_ms(),
            failure_yield_ms: 0,
        }
    }
}

impl ReconnectPolicy {
    pub fn sweep_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sweep_retry_delay_ms)
    }

    pub fn unsettled_backoff(&self) -> Duration {
        Duration::from_millis(self.unsettled_backoff_ms)
    }

    pub fn failure_yield(&self) -> Duration {
        Duration::from_millis(self.failure_yield_ms)
    }

    pub(super) fn validate(&self) -> Result<()> {
        if self.sweep_retry_delay_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "sweep_retry_delay_ms must be > 0, otherwise an unreachable ensemble busy-loops".into(),
            )));
        }
        Ok(())
    }
}

fn default_sweep_retry_delay_ms() -> u64 {
    5_000
}
fn default_unsettled_backoff_ms() -> u64 {
    10
}

//! Queue construction parameters and their validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by the pull and push queues.
///
/// The age triple drives the idle/erase lifecycle: the cleaner runs every
/// `check_time`, flags clients idle after `idle_age` without activity, and
/// erases them after `erase_age`. `system_capacity` (ops/sec) and `win_size`
/// (seconds) size the per-window resource budgets used for surplus sharing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub idle_age: Duration,
    pub erase_age: Duration,
    pub check_time: Duration,
    /// Aggregate capacity of the shared resource, in ops/sec.
    pub system_capacity: f64,
    /// Accounting window length in seconds.
    pub win_size: f64,
    /// Allow dispatching over-limit requests when nothing else is eligible.
    pub allow_limit_break: bool,
    /// Seconds a client's pacing survives a gap in its submissions.
    pub anticipation_timeout: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            idle_age: Duration::from_secs(600),
            erase_age: Duration::from_secs(900),
            check_time: Duration::from_secs(360),
            system_capacity: 8000.0,
            win_size: 30.0,
            allow_limit_break: false,
            anticipation_timeout: 0.0,
        }
    }
}

/// Rejected configuration; queue constructors fail with this instead of
/// panicking.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("erase_age {erase_age:?} must not be shorter than idle_age {idle_age:?}")]
    EraseBeforeIdle {
        idle_age: Duration,
        erase_age: Duration,
    },
    #[error("check_time {check_time:?} must be shorter than idle_age {idle_age:?}")]
    CheckTooSlow {
        check_time: Duration,
        idle_age: Duration,
    },
    #[error("win_size must be positive, got {0}")]
    BadWindow(f64),
    #[error("system_capacity must be non-negative, got {0}")]
    BadCapacity(f64),
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.erase_age < self.idle_age {
            return Err(ConfigError::EraseBeforeIdle {
                idle_age: self.idle_age,
                erase_age: self.erase_age,
            });
        }
        if self.check_time >= self.idle_age {
            return Err(ConfigError::CheckTooSlow {
                check_time: self.check_time,
                idle_age: self.idle_age,
            });
        }
        if !(self.win_size > 0.0) {
            return Err(ConfigError::BadWindow(self.win_size));
        }
        if !(self.system_capacity >= 0.0) {
            return Err(ConfigError::BadCapacity(self.system_capacity));
        }
        Ok(())
    }
}

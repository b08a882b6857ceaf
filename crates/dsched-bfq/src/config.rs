//! Scheduler tunables.
//!
//! All sizes are in bytes and all durations are in the unit named by the
//! field suffix. Defaults follow the classic BFQ policy constants.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BfqError, BfqResult};

/// Fixed-point shift used for rate arithmetic (bytes per microsecond).
pub const FIXPOINT_SHIFT: u32 = 10;

/// Weighted sample count an EWMA must reach before its average is trusted.
pub const VALID_MIN_SAMPLES: u64 = 80;

/// Default lower bound of a submitter's budget (16 KiB).
pub const DEFAULT_MIN_BUDGET: u64 = 32 * 512;

/// Default upper bound of a submitter's budget (512 KiB).
pub const DEFAULT_MAX_BUDGET: u64 = 1024 * 512;

/// Budgets below this are doubled on growth, above it stepped (128 KiB).
pub const DEFAULT_BUDGET_MULTIPLE_THRESHOLD: u64 = 256 * 512;

/// Linear budget growth step (64 KiB).
pub const DEFAULT_BUDGET_INC_STEP: u64 = 128 * 512;

/// Default maximum length of one activation.
pub const DEFAULT_SLICE_TIMEOUT_MS: u64 = 100;

/// Anticipation wait for well-behaved submitters.
pub const DEFAULT_AS_WAIT_US: u64 = 9_000;

/// Anticipation wait for seeky submitters.
pub const DEFAULT_AS_WAIT_SEEKY_US: u64 = 1_000;

/// Average seek distance above which a submitter counts as seeky (512 KiB).
pub const DEFAULT_SEEKY_THRESHOLD: u64 = 1024 * 512;

/// Upper bound on requests collected in one locked dispatch section.
pub const DEFAULT_MAX_DISPATCH_BATCH: usize = 32;

/// Configuration for one device's BFQ scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BfqConfig {
    /// Smallest budget a submitter may be assigned.
    pub min_budget: u64,
    /// Largest budget a submitter may be assigned (auto-tuned if enabled).
    pub max_budget: u64,
    /// Budget doubling stops at this size; growth becomes linear.
    pub budget_multiple_threshold: u64,
    /// Linear growth step above the doubling threshold.
    pub budget_inc_step: u64,
    /// Maximum wall time of one activation in milliseconds.
    pub slice_timeout_ms: u64,
    /// Anticipation wait in microseconds.
    pub as_wait_us: u64,
    /// Anticipation wait for seeky submitters in microseconds.
    pub as_wait_seeky_us: u64,
    /// Seek average (bytes) above which a submitter is seeky.
    pub seeky_threshold: u64,
    /// Weight given to new submitters.
    pub default_weight: u32,
    /// Whether anticipatory idling is enabled device-wide.
    pub as_enabled: bool,
    /// Whether `max_budget` follows the measured peak rate.
    pub auto_max_budget: bool,
    /// Maximum requests handed to the driver per dispatch section.
    pub max_dispatch_batch: usize,
}

impl Default for BfqConfig {
    fn default() -> Self {
        Self {
            min_budget: DEFAULT_MIN_BUDGET,
            max_budget: DEFAULT_MAX_BUDGET,
            budget_multiple_threshold: DEFAULT_BUDGET_MULTIPLE_THRESHOLD,
            budget_inc_step: DEFAULT_BUDGET_INC_STEP,
            slice_timeout_ms: DEFAULT_SLICE_TIMEOUT_MS,
            as_wait_us: DEFAULT_AS_WAIT_US,
            as_wait_seeky_us: DEFAULT_AS_WAIT_SEEKY_US,
            seeky_threshold: DEFAULT_SEEKY_THRESHOLD,
            default_weight: 1,
            as_enabled: true,
            auto_max_budget: false,
            max_dispatch_batch: DEFAULT_MAX_DISPATCH_BATCH,
        }
    }
}

impl BfqConfig {
    /// Parses a config from a JSON string. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> BfqResult<Self> {
        let config: BfqConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config from a JSON file.
    pub fn from_json_file(path: &Path) -> BfqResult<Self> {
        let json = std::fs::read_to_string(path)?;
        debug!("Loading BFQ config from {}", path.display());
        Self::from_json_str(&json)
    }

    /// Checks the config for inconsistent values.
    pub fn validate(&self) -> BfqResult<()> {
        if self.min_budget == 0 {
            return Err(invalid("min_budget must be non-zero"));
        }
        if self.min_budget > self.max_budget {
            return Err(invalid(format!(
                "min_budget {} exceeds max_budget {}",
                self.min_budget, self.max_budget
            )));
        }
        if self.slice_timeout_ms == 0 {
            return Err(invalid("slice_timeout_ms must be non-zero"));
        }
        if self.default_weight == 0 {
            return Err(invalid("default_weight must be non-zero"));
        }
        if self.max_dispatch_batch == 0 {
            return Err(invalid("max_dispatch_batch must be non-zero"));
        }
        if self.as_wait_seeky_us > self.as_wait_us {
            return Err(invalid(format!(
                "as_wait_seeky_us {} exceeds as_wait_us {}",
                self.as_wait_seeky_us, self.as_wait_us
            )));
        }
        Ok(())
    }

    /// Slice timeout in microseconds.
    #[inline]
    pub fn slice_timeout_us(&self) -> u64 {
        self.slice_timeout_ms * 1000
    }

    /// Anticipation wait for a submitter of the given locality class.
    #[inline]
    pub fn as_wait(&self, seeky: bool) -> Duration {
        if seeky {
            Duration::from_micros(self.as_wait_seeky_us)
        } else {
            Duration::from_micros(self.as_wait_us)
        }
    }
}

fn invalid(reason: impl Into<String>) -> BfqError {
    BfqError::InvalidConfig {
        reason: reason.into(),
    }
}

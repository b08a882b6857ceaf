//! Budget assignment after an activation ends.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::BfqConfig;

/// Why an activation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpireReason {
    /// The slice timeout elapsed before the budget was used up.
    Timeout,
    /// No new request arrived during an anticipation wait.
    TooIdle,
    /// The budget was used up within the slice.
    OutOfBudget,
}

impl fmt::Display for ExpireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpireReason::Timeout => write!(f, "timeout"),
            ExpireReason::TooIdle => write!(f, "too-idle"),
            ExpireReason::OutOfBudget => write!(f, "out-of-budget"),
        }
    }
}

/// Budget bounds and growth parameters in force for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    /// Lower bound.
    pub min: u64,
    /// Upper bound (may be auto-tuned, never below `min`).
    pub max: u64,
    /// Doubling stops at this size.
    pub multiple_threshold: u64,
    /// Linear growth step.
    pub inc_step: u64,
}

impl BudgetLimits {
    /// Limits from a config with the device's current max budget.
    pub fn from_config(config: &BfqConfig, max_budget: u64) -> Self {
        Self {
            min: config.min_budget,
            max: max_budget.max(config.min_budget),
            multiple_threshold: config.budget_multiple_threshold,
            inc_step: config.budget_inc_step,
        }
    }

    /// Clamps a budget into `[min, max]`.
    #[inline]
    pub fn clamp(&self, budget: u64) -> u64 {
        budget.clamp(self.min, self.max)
    }

    /// Budget after a submitter used up its previous one.
    pub fn grow(&self, budget: u64) -> u64 {
        let grown = if budget < self.multiple_threshold {
            budget.saturating_mul(2)
        } else {
            budget.saturating_add(self.inc_step)
        };
        self.clamp(grown)
    }

    /// Budget to assign on expiry.
    ///
    /// `service` is what completions credited during the activation and
    /// `in_flight` the requests still outstanding at the device.
    pub fn next_budget(&self, reason: ExpireReason, budget: u64, service: u64, in_flight: u64) -> u64 {
        match reason {
            ExpireReason::Timeout => self.clamp(service),
            ExpireReason::TooIdle if in_flight > 0 => self.clamp(service),
            ExpireReason::TooIdle => self.min,
            ExpireReason::OutOfBudget => self.grow(budget),
        }
    }
}

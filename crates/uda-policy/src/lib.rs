#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use uda_domain::Decision;

/// Highest aggregate uncertainty that still permits a direct answer.
pub const DEFAULT_UNCERTAINTY_THRESHOLD: f64 = 0.8;

/// Terminal classification of a run, shared by the auditor and supervisor
/// stages so both always agree on where the threshold sits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DecisionPolicy {
    pub threshold: f64,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_UNCERTAINTY_THRESHOLD,
        }
    }
}

impl DecisionPolicy {
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// `true` when `overall` is above the threshold. NaN counts as above.
    #[must_use]
    pub fn exceeds(&self, overall: f64) -> bool {
        overall.is_nan() || overall > self.threshold
    }

    /// Whether the run needs human review.
    #[must_use]
    pub fn flag(&self, overall: f64, faithful: bool) -> bool {
        self.exceeds(overall) || !faithful
    }

    #[must_use]
    pub fn decide(&self, overall: f64, faithful: bool) -> Decision {
        if self.flag(overall, faithful) {
            Decision::Dlq
        } else {
            Decision::Answer
        }
    }
}

//! Per-session admission counters.

use crate::types::ValidationResult;
use serde::{Deserialize, Serialize};

/// Running valid/invalid counts for one staff member at one event
///
/// Counts only ever grow. There is no decrement and no reset: a new session
/// starts from a fresh tally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTally {
    valid_count: u64,
    invalid_count: u64,
}

impl SessionTally {
    /// An empty tally
    #[must_use]
    pub const fn new() -> Self {
        Self {
            valid_count: 0,
            invalid_count: 0,
        }
    }

    /// Fold one terminal outcome into the tally
    pub const fn record(&mut self, result: &ValidationResult) {
        if result.is_admitted() {
            self.valid_count = self.valid_count.saturating_add(1);
        } else {
            self.invalid_count = self.invalid_count.saturating_add(1);
        }
    }

    /// Admissions, organic and override
    #[must_use]
    pub const fn valid_count(&self) -> u64 {
        self.valid_count
    }

    /// Every non-admitting outcome, transient errors included
    #[must_use]
    pub const fn invalid_count(&self) -> u64 {
        self.invalid_count
    }

    /// All outcomes recorded
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.valid_count.saturating_add(self.invalid_count)
    }
}

impl<'a> FromIterator<&'a ValidationResult> for SessionTally {
    fn from_iter<I: IntoIterator<Item = &'a ValidationResult>>(iter: I) -> Self {
        let mut tally = Self::new();
        for result in iter {
            tally.record(result);
        }
        tally
    }
}

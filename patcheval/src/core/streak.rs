//! Consecutive-failure tracking for early commit exit.

use crate::core::types::Verdict;

/// Counts consecutive failing classifying stages within one commit.
///
/// `ok` resets the streak; `fail` and `unknown` extend it. Free-text stages
/// leave it untouched. A threshold of 0 disables early exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureStreak {
    threshold: u32,
    count: u32,
}

impl FailureStreak {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            count: 0,
        }
    }

    /// Observe a recorded stage. Returns true when the commit should stop.
    pub fn observe(&mut self, verdict: Verdict, classifying: bool) -> bool {
        if !classifying {
            return false;
        }
        match verdict {
            Verdict::Ok => self.count = 0,
            Verdict::Fail | Verdict::Unknown => self.count += 1,
        }
        self.threshold > 0 && self.count >= self.threshold
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

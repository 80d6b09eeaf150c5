//! Deterministic classification of raw model responses.

use regex::Regex;

use crate::core::types::StageRules;

/// A single yes/no predicate over response text.
pub trait Matcher {
    fn matches(&self, response: &str) -> bool;
}

impl Matcher for Regex {
    fn matches(&self, response: &str) -> bool {
        self.is_match(response)
    }
}

/// Ternary result of matching a response against a stage's two predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Ok,
    Fail,
    /// Matched both predicates or neither: a protocol fault, never a verdict.
    Ambiguous,
}

/// Classify `response` against independent ok/fail predicates.
///
/// - exactly one predicate matches: that verdict.
/// - both or neither match: `Ambiguous`.
pub fn classify<O: Matcher + ?Sized, F: Matcher + ?Sized>(
    response: &str,
    ok: &O,
    fail: &F,
) -> Classification {
    match (ok.matches(response), fail.matches(response)) {
        (true, false) => Classification::Ok,
        (false, true) => Classification::Fail,
        (true, true) | (false, false) => Classification::Ambiguous,
    }
}

/// Classify against a stage's compiled rules.
pub fn classify_with_rules(response: &str, rules: &StageRules) -> Classification {
    classify(response, &rules.ok, &rules.fail)
}

//! Verdict composition: per-stage fold accumulator and commit-level named outcomes.

use std::collections::BTreeMap;

use crate::core::types::{CommitResult, FoldPolicy, OutcomeRule};

/// Accumulator for the classifying sub-results of one stage invocation.
///
/// Starts at the policy identity, so a stage with no classifying sub-results
/// contributes `true` under `All` and `false` under `Any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartFold {
    policy: FoldPolicy,
    acc: bool,
    parts: u32,
}

impl PartFold {
    pub fn new(policy: FoldPolicy) -> Self {
        Self {
            policy,
            acc: policy.identity(),
            parts: 0,
        }
    }

    pub fn push(&mut self, value: bool) {
        self.acc = self.policy.combine(self.acc, value);
        self.parts += 1;
    }

    pub fn value(&self) -> bool {
        self.acc
    }

    pub fn parts(&self) -> u32 {
        self.parts
    }
}

/// Evaluate one named outcome. Stages that did not run, or ran without a
/// contribution, count as `false`.
pub fn evaluate_outcome(rule: &OutcomeRule, result: &CommitResult) -> bool {
    let mut acc = rule.policy.identity();
    for stage in &rule.stages {
        let value = result
            .get(stage)
            .and_then(|stage_result| stage_result.contribution)
            .unwrap_or(false);
        acc = rule.policy.combine(acc, value);
    }
    acc
}

/// Evaluate every named outcome for a commit.
pub fn evaluate_outcomes(rules: &[OutcomeRule], result: &CommitResult) -> BTreeMap<String, bool> {
    rules
        .iter()
        .map(|rule| (rule.name.clone(), evaluate_outcome(rule, result)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Commit, StageMetrics, StageResult, Verdict};

    fn commit_result(stages: &[(&str, Option<bool>)]) -> CommitResult {
        let commit = Commit {
            id: "c1".to_string(),
            message_short: "m".to_string(),
            message: "m".to_string(),
            patch: "diff".to_string(),
            parent_count: 1,
        };
        let mut result = CommitResult::new(&commit);
        for (name, contribution) in stages {
            result
                .record(StageResult {
                    stage: name.to_string(),
                    verdict: match contribution {
                        Some(true) => Verdict::Ok,
                        Some(false) => Verdict::Fail,
                        None => Verdict::Unknown,
                    },
                    classifying: true,
                    contribution: *contribution,
                    response: String::new(),
                    metrics: StageMetrics::default(),
                    retries: 0,
                })
                .expect("record");
        }
        result
    }

    fn rule(name: &str, policy: FoldPolicy, stages: &[&str]) -> OutcomeRule {
        OutcomeRule {
            name: name.to_string(),
            policy,
            stages: stages.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn empty_fold_yields_policy_identity() {
        assert!(PartFold::new(FoldPolicy::All).value());
        assert!(!PartFold::new(FoldPolicy::Any).value());
        assert_eq!(PartFold::new(FoldPolicy::All).parts(), 0);
    }

    #[test]
    fn singleton_fold_yields_the_value() {
        for policy in [FoldPolicy::All, FoldPolicy::Any] {
            for value in [true, false] {
                let mut fold = PartFold::new(policy);
                fold.push(value);
                assert_eq!(fold.value(), value, "{policy:?} {value}");
            }
        }
    }

    #[test]
    fn all_outcome_requires_every_stage_ok() {
        let result = commit_result(&[("bug-01", Some(true)), ("stable-01", Some(false))]);
        assert!(!evaluate_outcome(
            &rule("LTS", FoldPolicy::All, &["bug-01", "stable-01"]),
            &result
        ));
        assert!(evaluate_outcome(
            &rule("ANY", FoldPolicy::Any, &["bug-01", "stable-01"]),
            &result
        ));
    }

    #[test]
    fn missing_and_unknown_stages_count_as_false() {
        let result = commit_result(&[("bug-01", Some(true)), ("security-01", None)]);
        let outcomes = evaluate_outcomes(
            &[
                rule("SEC", FoldPolicy::All, &["bug-01", "security-01"]),
                rule("KLP", FoldPolicy::All, &["bug-01", "kpatch-build-02"]),
                rule("BUG", FoldPolicy::All, &["bug-01"]),
            ],
            &result,
        );
        assert_eq!(outcomes.get("SEC"), Some(&false));
        assert_eq!(outcomes.get("KLP"), Some(&false));
        assert_eq!(outcomes.get("BUG"), Some(&true));
    }
}

//! Plan runner: every configured stage, in order, for one commit.

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::core::fold::evaluate_outcomes;
use crate::core::streak::FailureStreak;
use crate::core::types::{Commit, CommitResult, Plan, StageResult};
use crate::io::backend::Backend;
use crate::io::progress::ProgressReporter;
use crate::io::prompt::PromptParams;
use crate::io::trace::TraceSink;
use crate::stage::StageExecutor;

/// Why a commit is recorded without running any stage.
pub fn skip_reason(plan: &Plan, commit: &Commit) -> Option<&'static str> {
    if commit.is_content_free_merge() {
        Some("merge commit without changes")
    } else if commit.is_merge() && plan.skip_merge_commits {
        Some("merge commit")
    } else {
        None
    }
}

pub struct PlanRunner<'a, B: Backend + ?Sized> {
    plan: &'a Plan,
    executor: StageExecutor<'a, B>,
}

impl<'a, B: Backend + ?Sized> PlanRunner<'a, B> {
    pub fn new(plan: &'a Plan, executor: StageExecutor<'a, B>) -> Self {
        Self { plan, executor }
    }

    pub fn plan(&self) -> &Plan {
        self.plan
    }

    /// Run the plan for `commit`.
    ///
    /// `recorded` holds results a previous run already persisted for this
    /// commit; those stages are not executed again but still feed the prompt
    /// context and the failure streak. `on_stage` is called once for every
    /// newly executed stage, before the next stage starts.
    #[instrument(skip_all, fields(commit = %commit.id))]
    pub fn run_commit(
        &self,
        commit: &Commit,
        recorded: &[StageResult],
        trace: &mut dyn TraceSink,
        progress: &mut dyn ProgressReporter,
        on_stage: &mut dyn FnMut(&StageResult) -> Result<()>,
    ) -> Result<CommitResult> {
        let mut result = CommitResult::new(commit);
        if let Some(reason) = skip_reason(self.plan, commit) {
            progress.commit_skipped(&commit.id, reason)?;
            return Ok(result);
        }

        let mut streak = FailureStreak::new(self.plan.skip_threshold);
        let mut response_prev = String::new();
        let mut response_first = String::new();

        for (index, spec) in self.plan.stages.iter().enumerate() {
            let stage_result = match recorded.iter().find(|done| done.stage == spec.name) {
                Some(done) => {
                    debug!(stage = %spec.name, "stage restored from checkpoint");
                    done.clone()
                }
                None => {
                    progress.stage_started(&spec.name)?;
                    let params = PromptParams::new(commit, &response_prev, &response_first);
                    let fresh = self.executor.execute(spec, &params, trace)?;
                    on_stage(&fresh)?;
                    fresh
                }
            };
            progress.stage_finished(&stage_result)?;

            if index == 0 {
                response_first = stage_result.response.clone();
            }
            response_prev = stage_result.response.clone();
            let stop = streak.observe(stage_result.verdict, stage_result.classifying);
            result.record(stage_result).map_err(|err| anyhow!(err))?;

            if stop {
                debug!(fails = streak.count(), "consecutive failure threshold reached");
                result.early_exit = true;
                break;
            }
        }

        result.consecutive_fails = streak.count();
        result.outcomes = evaluate_outcomes(&self.plan.outcomes, &result);
        result.mark_complete();
        progress.commit_finished(&result)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::core::types::{FoldPolicy, OutcomeRule, StageMetrics, Verdict};
    use crate::io::prompt::PromptRenderer;
    use crate::stage::ExecutorSettings;
    use crate::test_support::{
        RecordingProgress, RecordingTrace, ScriptedBackend, ScriptedReply, classifying_stage,
        empty_merge, free_text_stage, sample_commit,
    };
    use std::time::Duration;

    fn plan(stages: Vec<crate::core::types::StageSpec>, threshold: u32) -> Plan {
        Plan {
            stages,
            outcomes: Vec::new(),
            skip_threshold: threshold,
            skip_merge_commits: true,
        }
    }

    fn three_stage_plan(threshold: u32) -> Plan {
        plan(
            vec![
                classifying_stage("bug-01", "BUGFIX", "NOT", FoldPolicy::Any),
                classifying_stage("stable-01", "BACKPORT", "SKIP", FoldPolicy::Any),
                classifying_stage("security-01", "YES", "NO", FoldPolicy::Any),
            ],
            threshold,
        )
    }

    fn renderer() -> PromptRenderer {
        PromptRenderer::from_templates([
            ("commit-summary", "summary of {{ commit }}"),
            ("bug-01", "bug? {{ commit }} prev=[{{ plan_response_prev }}]"),
            (
                "stable-01",
                "stable? {{ commit }} prev=[{{ plan_response_prev }}] first=[{{ plan_response_first }}]",
            ),
            ("security-01", "security? {{ commit }}"),
        ])
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            max_retries: 3,
            backoff: Duration::ZERO,
            widen_output_step: None,
            widen_output_max: None,
        }
    }

    struct Outcome {
        result: CommitResult,
        persisted: Vec<String>,
        progress: RecordingProgress,
    }

    fn run_plan(
        plan: &Plan,
        backend: &ScriptedBackend,
        commit: &Commit,
        recorded: &[StageResult],
    ) -> Outcome {
        let renderer = renderer();
        let settings = settings();
        let cancel = CancelToken::new();
        let runner = PlanRunner::new(
            plan,
            StageExecutor::new(backend, &renderer, &settings, &cancel),
        );
        let mut persisted = Vec::new();
        let mut progress = RecordingProgress::default();
        let result = runner
            .run_commit(
                commit,
                recorded,
                &mut RecordingTrace::default(),
                &mut progress,
                &mut |stage| {
                    persisted.push(stage.stage.clone());
                    Ok(())
                },
            )
            .expect("run commit");
        Outcome {
            result,
            persisted,
            progress,
        }
    }

    #[test]
    fn first_failure_with_threshold_one_stops_the_commit() {
        let backend = ScriptedBackend::new([ScriptedReply::text("NOT")]);
        let outcome = run_plan(&three_stage_plan(1), &backend, &sample_commit("c1", "m"), &[]);
        assert_eq!(backend.call_count(), 1);
        assert!(outcome.result.early_exit);
        assert!(!outcome.result.skipped);
        assert_eq!(outcome.result.consecutive_fails, 1);
        assert_eq!(outcome.result.stages().len(), 1);
        assert!(outcome.result.get("stable-01").is_none());
        assert_eq!(outcome.persisted, vec!["bug-01"]);
    }

    #[test]
    fn ok_resets_the_streak() {
        let backend = ScriptedBackend::new([
            ScriptedReply::text("NOT"),
            ScriptedReply::text("BACKPORT"),
            ScriptedReply::text("NO"),
        ]);
        let outcome = run_plan(&three_stage_plan(2), &backend, &sample_commit("c1", "m"), &[]);
        assert_eq!(backend.call_count(), 3);
        assert!(!outcome.result.early_exit);
        assert_eq!(outcome.result.consecutive_fails, 1);
    }

    #[test]
    fn exhausted_stage_counts_toward_the_streak() {
        let backend = ScriptedBackend::from_fn(|_| ScriptedReply::text("unclear"));
        let outcome = run_plan(&three_stage_plan(1), &backend, &sample_commit("c1", "m"), &[]);
        let bug = outcome.result.get("bug-01").expect("bug-01 recorded");
        assert_eq!(bug.verdict, Verdict::Unknown);
        assert_eq!(backend.call_count(), 3);
        assert!(outcome.result.early_exit);
    }

    #[test]
    fn threshold_zero_runs_every_stage() {
        let backend = ScriptedBackend::from_fn(|_| ScriptedReply::text("NOT SKIP NO"));
        let plan = plan(
            vec![
                classifying_stage("bug-01", "BUGFIX", "NOT", FoldPolicy::Any),
                classifying_stage("stable-01", "BACKPORT", "SKIP", FoldPolicy::Any),
            ],
            0,
        );
        let outcome = run_plan(&plan, &backend, &sample_commit("c1", "m"), &[]);
        assert_eq!(outcome.result.stages().len(), 2);
        assert!(!outcome.result.early_exit);
        assert_eq!(outcome.result.consecutive_fails, 2);
    }

    #[test]
    fn responses_flow_into_later_prompts() {
        let backend = ScriptedBackend::new([
            ScriptedReply::text("it fixes a leak"),
            ScriptedReply::text("BUGFIX"),
            ScriptedReply::text("BACKPORT"),
        ]);
        let plan = plan(
            vec![
                free_text_stage("commit-summary", FoldPolicy::Any),
                classifying_stage("bug-01", "BUGFIX", "NOT", FoldPolicy::Any),
                classifying_stage("stable-01", "BACKPORT", "SKIP", FoldPolicy::Any),
            ],
            1,
        );
        run_plan(&plan, &backend, &sample_commit("c1", "m"), &[]);
        let prompts: Vec<String> = backend
            .requests()
            .into_iter()
            .map(|request| request.prompt)
            .collect();
        assert_eq!(prompts[0], "summary of c1");
        assert_eq!(prompts[1], "bug? c1 prev=[it fixes a leak]");
        assert_eq!(prompts[2], "stable? c1 prev=[BUGFIX] first=[it fixes a leak]");
    }

    #[test]
    fn free_text_stage_leaves_streak_alone() {
        let backend = ScriptedBackend::new([
            ScriptedReply::text("NOT"),
            ScriptedReply::text("summary mentioning NOT"),
            ScriptedReply::text("SKIP"),
        ]);
        let plan = plan(
            vec![
                classifying_stage("bug-01", "BUGFIX", "NOT", FoldPolicy::Any),
                free_text_stage("commit-summary", FoldPolicy::Any),
                classifying_stage("stable-01", "BACKPORT", "SKIP", FoldPolicy::Any),
            ],
            2,
        );
        let outcome = run_plan(&plan, &backend, &sample_commit("c1", "m"), &[]);
        assert!(outcome.result.early_exit);
        assert_eq!(outcome.result.consecutive_fails, 2);
        assert_eq!(outcome.result.stages().len(), 3);
    }

    #[test]
    fn content_free_merge_is_skipped_without_backend_calls() {
        let backend = ScriptedBackend::new(Vec::new());
        let mut plan = three_stage_plan(1);
        plan.skip_merge_commits = false;
        let outcome = run_plan(&plan, &backend, &empty_merge("m1"), &[]);
        assert!(outcome.result.skipped);
        assert!(outcome.result.stages().is_empty());
        assert_eq!(backend.call_count(), 0);
        assert_eq!(
            outcome.progress.events,
            vec!["skipped m1 merge commit without changes"]
        );
    }

    #[test]
    fn merge_with_diff_follows_policy() {
        let mut merge = sample_commit("m2", "Merge branch 'fixes'");
        merge.parent_count = 2;
        assert_eq!(skip_reason(&three_stage_plan(1), &merge), Some("merge commit"));

        let mut plan = three_stage_plan(1);
        plan.skip_merge_commits = false;
        assert_eq!(skip_reason(&plan, &merge), None);
        let backend = ScriptedBackend::new([ScriptedReply::text("NOT")]);
        let outcome = run_plan(&plan, &backend, &merge, &[]);
        assert!(!outcome.result.skipped);
        assert_eq!(backend.call_count(), 1);
    }

    #[test]
    fn recorded_stages_are_not_rerun_but_feed_context() {
        let recorded = vec![StageResult {
            stage: "bug-01".to_string(),
            verdict: Verdict::Ok,
            classifying: true,
            contribution: Some(true),
            response: "BUGFIX".to_string(),
            metrics: StageMetrics::default(),
            retries: 0,
        }];
        let backend = ScriptedBackend::new([ScriptedReply::text("BACKPORT"), ScriptedReply::text("NO")]);
        let outcome = run_plan(&three_stage_plan(1), &backend, &sample_commit("c1", "m"), &recorded);
        assert_eq!(outcome.persisted, vec!["stable-01"]);
        assert_eq!(
            backend.requests()[0].prompt,
            "stable? c1 prev=[BUGFIX] first=[BUGFIX]"
        );
        assert_eq!(outcome.result.stages().len(), 3);
        assert!(outcome.result.early_exit);
    }

    #[test]
    fn recorded_early_exit_runs_nothing() {
        let recorded = vec![StageResult {
            stage: "bug-01".to_string(),
            verdict: Verdict::Fail,
            classifying: true,
            contribution: Some(false),
            response: "NOT".to_string(),
            metrics: StageMetrics::default(),
            retries: 0,
        }];
        let backend = ScriptedBackend::new(Vec::new());
        let outcome = run_plan(&three_stage_plan(1), &backend, &sample_commit("c1", "m"), &recorded);
        assert_eq!(backend.call_count(), 0);
        assert!(outcome.result.early_exit);
        assert!(outcome.persisted.is_empty());
    }

    #[test]
    fn named_outcomes_are_evaluated() {
        let mut plan = three_stage_plan(0);
        plan.outcomes = vec![
            OutcomeRule {
                name: "LTS".to_string(),
                policy: FoldPolicy::All,
                stages: vec!["bug-01".to_string(), "stable-01".to_string()],
            },
            OutcomeRule {
                name: "ANY".to_string(),
                policy: FoldPolicy::Any,
                stages: vec!["stable-01".to_string(), "security-01".to_string()],
            },
        ];
        let backend = ScriptedBackend::new([
            ScriptedReply::text("BUGFIX"),
            ScriptedReply::text("SKIP"),
            ScriptedReply::text("YES"),
        ]);
        let outcome = run_plan(&plan, &backend, &sample_commit("c1", "m"), &[]);
        assert_eq!(outcome.result.outcomes.get("LTS"), Some(&false));
        assert_eq!(outcome.result.outcomes.get("ANY"), Some(&true));
    }
}

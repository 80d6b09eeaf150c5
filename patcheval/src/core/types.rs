//! Shared deterministic types for the classification engine.
//!
//! These types define stable contracts between the stage executor, the plan
//! runner and the checkpoint log. They carry no I/O and serialize to the
//! lowercase names used in persisted rows.

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome of one stage for one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Ok,
    Fail,
    /// Free-text stage, or a classifying stage whose retries ran out.
    Unknown,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Ok => "ok",
            Verdict::Fail => "fail",
            Verdict::Unknown => "unknown",
        }
    }
}

/// How sub-results of a single stage invocation combine.
///
/// `All` folds with logical AND starting from `true`; `Any` folds with
/// logical OR starting from `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FoldPolicy {
    #[serde(alias = "and", alias = "AND", alias = "ALL")]
    All,
    #[default]
    #[serde(alias = "or", alias = "OR", alias = "ANY")]
    Any,
}

impl FoldPolicy {
    pub fn identity(self) -> bool {
        match self {
            FoldPolicy::All => true,
            FoldPolicy::Any => false,
        }
    }

    pub fn combine(self, acc: bool, value: bool) -> bool {
        match self {
            FoldPolicy::All => acc && value,
            FoldPolicy::Any => acc || value,
        }
    }
}

/// A commit as produced by the commit source. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: String,
    pub message_short: String,
    pub message: String,
    /// All file-level hunks concatenated.
    pub patch: String,
    pub parent_count: usize,
}

impl Commit {
    pub fn is_merge(&self) -> bool {
        self.parent_count > 1
    }

    /// Merge commit that introduces no change relative to its first parent.
    pub fn is_content_free_merge(&self) -> bool {
        self.is_merge() && self.patch.trim().is_empty()
    }
}

/// The pair of patterns a classifying stage matches responses against.
#[derive(Debug, Clone)]
pub struct StageRules {
    pub ok: Regex,
    pub fail: Regex,
}

/// Backend knobs for one stage. Opaque to the engine apart from the seed and
/// output-length keys it perturbs on protocol retries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendParams {
    pub model: String,
    pub options: Map<String, Value>,
}

/// One configured question posed to the model.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    /// `None` marks a free-text stage that produces no verdict.
    pub rules: Option<StageRules>,
    pub policy: FoldPolicy,
    /// Template appended to the running prompt after an ambiguous response.
    pub repair_prompt: String,
    pub params: BackendParams,
}

impl StageSpec {
    pub fn is_classifying(&self) -> bool {
        self.rules.is_some()
    }
}

/// Commit-level verdict composed from several stage contributions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRule {
    pub name: String,
    pub policy: FoldPolicy,
    pub stages: Vec<String>,
}

/// Ordered stages executed for every commit plus commit-level policies.
#[derive(Debug, Clone)]
pub struct Plan {
    pub stages: Vec<StageSpec>,
    pub outcomes: Vec<OutcomeRule>,
    /// Consecutive classifying failures that end a commit early (0 disables).
    pub skip_threshold: u32,
    /// Skip merge commits even when they carry a diff.
    pub skip_merge_commits: bool,
}

impl Plan {
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name.as_str()).collect()
    }
}

/// Size and timing observations for one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageMetrics {
    /// Bytes of every prompt sent, summed across attempts.
    pub prompt_bytes: usize,
    /// Bytes of every response received, summed across attempts.
    pub response_bytes: usize,
    pub prompt_tokens: Option<u64>,
    pub response_tokens: Option<u64>,
    pub prompt_tokens_per_sec: Option<f64>,
    pub response_tokens_per_sec: Option<f64>,
    pub elapsed: Duration,
}

impl StageMetrics {
    /// Combined prompt and response throughput in bytes per second.
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.prompt_bytes + self.response_bytes) as f64 / secs
    }
}

/// Recorded outcome of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub stage: String,
    pub verdict: Verdict,
    pub classifying: bool,
    /// Folded accumulator value; `None` when retries were exhausted.
    pub contribution: Option<bool>,
    /// Raw text of the last backend response.
    pub response: String,
    pub metrics: StageMetrics,
    /// Protocol-fault retries consumed.
    pub retries: u32,
}

/// Per-commit aggregation of stage results.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitResult {
    pub commit_id: String,
    pub message_short: String,
    stages: Vec<StageResult>,
    /// True until the plan ran to completion or exited early.
    pub skipped: bool,
    pub consecutive_fails: u32,
    pub early_exit: bool,
    pub outcomes: BTreeMap<String, bool>,
}

impl CommitResult {
    pub fn new(commit: &Commit) -> Self {
        Self {
            commit_id: commit.id.clone(),
            message_short: commit.message_short.clone(),
            stages: Vec::new(),
            skipped: true,
            consecutive_fails: 0,
            early_exit: false,
            outcomes: BTreeMap::new(),
        }
    }

    /// Append a stage result. A stage is recorded at most once per commit.
    pub fn record(&mut self, result: StageResult) -> Result<(), String> {
        if self.get(&result.stage).is_some() {
            return Err(format!(
                "stage '{}' already recorded for commit {}",
                result.stage, self.commit_id
            ));
        }
        self.stages.push(result);
        Ok(())
    }

    pub fn get(&self, stage: &str) -> Option<&StageResult> {
        self.stages.iter().find(|result| result.stage == stage)
    }

    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    pub fn mark_complete(&mut self) {
        self.skipped = false;
    }
}

//! Append-only checkpoint log (`checkpoint.jsonl`).
//!
//! One JSON object per line. `stage` rows are written as soon as a stage
//! resolves; a `commit` row closes a commit. The same file is the resume index
//! for a later run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{CommitResult, StageMetrics, StageResult, Verdict};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointRow {
    Stage(StageRow),
    Commit(CommitRow),
}

impl CheckpointRow {
    pub fn commit_id(&self) -> &str {
        match self {
            CheckpointRow::Stage(row) => &row.commit,
            CheckpointRow::Commit(row) => &row.commit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRow {
    pub commit: String,
    pub message_short: String,
    pub stage: String,
    pub verdict: Verdict,
    pub classifying: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contribution: Option<bool>,
    pub prompt_bytes: usize,
    pub response_bytes: usize,
    pub elapsed_secs: f64,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_tokens_per_sec: Option<f64>,
    pub response: String,
}

impl StageRow {
    pub fn new(commit: &str, message_short: &str, result: &StageResult) -> Self {
        let metrics = &result.metrics;
        Self {
            commit: commit.to_string(),
            message_short: message_short.to_string(),
            stage: result.stage.clone(),
            verdict: result.verdict,
            classifying: result.classifying,
            contribution: result.contribution,
            prompt_bytes: metrics.prompt_bytes,
            response_bytes: metrics.response_bytes,
            elapsed_secs: metrics.elapsed.as_secs_f64(),
            retries: result.retries,
            prompt_tokens: metrics.prompt_tokens,
            response_tokens: metrics.response_tokens,
            prompt_tokens_per_sec: metrics.prompt_tokens_per_sec,
            response_tokens_per_sec: metrics.response_tokens_per_sec,
            response: result.response.clone(),
        }
    }

    pub fn to_result(&self) -> StageResult {
        StageResult {
            stage: self.stage.clone(),
            verdict: self.verdict,
            classifying: self.classifying,
            contribution: self.contribution,
            response: self.response.clone(),
            metrics: StageMetrics {
                prompt_bytes: self.prompt_bytes,
                response_bytes: self.response_bytes,
                prompt_tokens: self.prompt_tokens,
                response_tokens: self.response_tokens,
                prompt_tokens_per_sec: self.prompt_tokens_per_sec,
                response_tokens_per_sec: self.response_tokens_per_sec,
                elapsed: Duration::try_from_secs_f64(self.elapsed_secs).unwrap_or_default(),
            },
            retries: self.retries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStatus {
    Complete,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRow {
    pub commit: String,
    pub message_short: String,
    pub status: CommitStatus,
    pub consecutive_fails: u32,
    pub early_exit: bool,
    #[serde(default)]
    pub outcomes: BTreeMap<String, bool>,
}

impl CommitRow {
    pub fn new(result: &CommitResult) -> Self {
        Self {
            commit: result.commit_id.clone(),
            message_short: result.message_short.clone(),
            status: if result.skipped {
                CommitStatus::Skipped
            } else {
                CommitStatus::Complete
            },
            consecutive_fails: result.consecutive_fails,
            early_exit: result.early_exit,
            outcomes: result.outcomes.clone(),
        }
    }
}

/// Durable destination for checkpoint rows.
pub trait RowSink {
    fn append(&mut self, row: &CheckpointRow) -> Result<()>;
}

/// Appends rows to a JSONL file, one write and flush per row.
pub struct CheckpointWriter {
    file: File,
}

impl CheckpointWriter {
    /// Open `path` for appending, creating it if needed.
    ///
    /// A trailing partial line left by a crash is cut off so the next row
    /// starts on its own line and the file stays loadable.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open checkpoint {}", path.display()))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .with_context(|| format!("read {}", path.display()))?;
        if let Some(keep) = complete_prefix_len(&contents) {
            warn!(
                path = %path.display(),
                dropped_bytes = contents.len() - keep,
                "dropping partial checkpoint line"
            );
            file.set_len(keep as u64)
                .with_context(|| format!("truncate {}", path.display()))?;
        }
        Ok(Self { file })
    }
}

/// Length of `contents` up to and including its last newline, when the file
/// ends in an unterminated line.
fn complete_prefix_len(contents: &[u8]) -> Option<usize> {
    match contents.last() {
        None | Some(b'\n') => None,
        Some(_) => Some(
            contents
                .iter()
                .rposition(|byte| *byte == b'\n')
                .map_or(0, |at| at + 1),
        ),
    }
}

impl RowSink for CheckpointWriter {
    fn append(&mut self, row: &CheckpointRow) -> Result<()> {
        let mut line = serde_json::to_string(row).context("serialize checkpoint row")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .context("write checkpoint row")?;
        self.file.flush().context("flush checkpoint")
    }
}

/// Read every row of a checkpoint file.
///
/// An unparsable final line is treated as an interrupted write and dropped;
/// unparsable lines elsewhere are an error.
pub fn load_checkpoint(path: &Path) -> Result<Vec<CheckpointRow>> {
    // Raw bytes: a torn write may end inside a multi-byte character.
    let contents = fs::read(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let lines: Vec<(usize, &[u8])> = contents
        .split(|byte| *byte == b'\n')
        .enumerate()
        .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
        .collect();
    let last = lines.len().saturating_sub(1);
    let mut rows = Vec::with_capacity(lines.len());
    for (pos, (lineno, line)) in lines.iter().enumerate() {
        match serde_json::from_slice::<CheckpointRow>(line) {
            Ok(row) => rows.push(row),
            Err(err) if pos == last => {
                warn!(line = lineno + 1, error = %err, "ignoring truncated final checkpoint line");
            }
            Err(err) => {
                return Err(anyhow!(
                    "{}:{}: invalid checkpoint row: {err}",
                    path.display(),
                    lineno + 1
                ));
            }
        }
    }
    debug!(rows = rows.len(), "checkpoint loaded");
    Ok(rows)
}

/// What a previous run already recorded, keyed by commit id.
#[derive(Debug, Clone, Default)]
pub struct ResumeIndex {
    finished: HashSet<String>,
    partial: HashMap<String, Vec<StageResult>>,
}

impl ResumeIndex {
    pub fn from_rows(rows: &[CheckpointRow]) -> Self {
        let mut index = Self::default();
        for row in rows {
            match row {
                CheckpointRow::Commit(row) => {
                    index.partial.remove(&row.commit);
                    index.finished.insert(row.commit.clone());
                }
                CheckpointRow::Stage(row) => {
                    if index.finished.contains(&row.commit) {
                        continue;
                    }
                    let stages = index.partial.entry(row.commit.clone()).or_default();
                    if stages.iter().all(|stage| stage.stage != row.stage) {
                        stages.push(row.to_result());
                    }
                }
            }
        }
        index
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_rows(&load_checkpoint(path)?))
    }

    /// The commit has a closing `commit` row.
    pub fn is_complete(&self, commit: &str) -> bool {
        self.finished.contains(commit)
    }

    /// Stage results recorded for an unfinished commit, in plan order.
    pub fn recorded(&self, commit: &str) -> &[StageResult] {
        self.partial.get(commit).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    pub fn partial_count(&self) -> usize {
        self.partial.len()
    }
}

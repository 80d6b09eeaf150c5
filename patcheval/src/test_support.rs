//! Test-only doubles: scripted backend, in-memory commit source, recording
//! sinks and a throwaway git repository.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::core::types::{
    BackendParams, Commit, CommitResult, FoldPolicy, StageResult, StageRules, StageSpec,
};
use crate::io::backend::{Backend, BackendError, GenerateRequest, GenerateResponse};
use crate::io::checkpoint::{CheckpointRow, RowSink};
use crate::io::git::{CommitSource, Git};
use crate::io::progress::{CommitHeader, ProgressReporter};
use crate::io::trace::{TraceEntry, TraceSink};

/// One canned backend reaction.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(GenerateResponse),
    Transient(String),
    Rejected { status: u16, body: String },
    Cancelled,
}

impl ScriptedReply {
    pub fn text(response: &str) -> Self {
        ScriptedReply::Text(GenerateResponse::text(response))
    }

    pub fn transient(reason: &str) -> Self {
        ScriptedReply::Transient(reason.to_string())
    }
}

type ReplyFn = Box<dyn Fn(&GenerateRequest) -> ScriptedReply>;

/// Backend that replays a queue of replies, then falls back to a closure.
///
/// Running past the end of the script without a fallback is reported as a
/// rejection so the test fails loudly instead of retrying forever.
pub struct ScriptedBackend {
    script: RefCell<VecDeque<ScriptedReply>>,
    fallback: Option<ReplyFn>,
    requests: RefCell<Vec<GenerateRequest>>,
}

impl ScriptedBackend {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            script: RefCell::new(replies.into_iter().collect()),
            fallback: None,
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn from_fn(reply: impl Fn(&GenerateRequest) -> ScriptedReply + 'static) -> Self {
        Self {
            fallback: Some(Box::new(reply)),
            ..Self::new(Vec::new())
        }
    }

    /// Answer by matching each key against the prompt; first hit wins.
    pub fn by_prompt(rules: Vec<(&str, &str)>) -> Self {
        let rules: Vec<(String, String)> = rules
            .into_iter()
            .map(|(needle, reply)| (needle.to_string(), reply.to_string()))
            .collect();
        Self::from_fn(move |request| {
            rules
                .iter()
                .find(|(needle, _)| request.prompt.contains(needle.as_str()))
                .map(|(_, reply)| ScriptedReply::text(reply))
                .unwrap_or_else(|| ScriptedReply::Rejected {
                    status: 599,
                    body: format!("no scripted reply for prompt: {}", request.prompt),
                })
        })
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl Backend for ScriptedBackend {
    fn generate(
        &self,
        request: &GenerateRequest,
        _cancel: &CancelToken,
    ) -> Result<GenerateResponse, BackendError> {
        self.requests.borrow_mut().push(request.clone());
        let next = self.script.borrow_mut().pop_front();
        let reply = match (next, &self.fallback) {
            (Some(reply), _) => reply,
            (None, Some(fallback)) => fallback(request),
            (None, None) => ScriptedReply::Rejected {
                status: 599,
                body: "backend script exhausted".to_string(),
            },
        };
        match reply {
            ScriptedReply::Text(response) => Ok(response),
            ScriptedReply::Transient(reason) => Err(BackendError::Transient(reason)),
            ScriptedReply::Rejected { status, body } => Err(BackendError::Rejected { status, body }),
            ScriptedReply::Cancelled => Err(BackendError::Cancelled),
        }
    }
}

/// Cancel `token` on the `n`th call (1-based) and report the call as cancelled.
pub fn cancel_on_call(
    token: CancelToken,
    n: usize,
    reply: impl Fn(&GenerateRequest) -> ScriptedReply + 'static,
) -> ScriptedBackend {
    let calls = Cell::new(0usize);
    ScriptedBackend::from_fn(move |request| {
        calls.set(calls.get() + 1);
        if calls.get() == n {
            token.cancel();
            return ScriptedReply::Cancelled;
        }
        reply(request)
    })
}

/// Commits held in memory, in the given order.
#[derive(Debug, Clone, Default)]
pub struct MemoryCommitSource {
    commits: Vec<Commit>,
}

impl MemoryCommitSource {
    pub fn new(commits: Vec<Commit>) -> Self {
        Self { commits }
    }
}

impl CommitSource for MemoryCommitSource {
    fn commit_ids(&self) -> Result<Vec<String>> {
        Ok(self.commits.iter().map(|commit| commit.id.clone()).collect())
    }

    fn load(&self, id: &str) -> Result<Commit> {
        self.commits
            .iter()
            .find(|commit| commit.id == id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown commit {id}"))
    }
}

#[derive(Debug, Default)]
pub struct RecordingTrace {
    pub entries: Vec<TraceEntry>,
}

impl TraceSink for RecordingTrace {
    fn record(&mut self, entry: &TraceEntry) -> Result<()> {
        self.entries.push(entry.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingRows {
    pub rows: Vec<CheckpointRow>,
}

impl RecordingRows {
    /// `(commit, stage, verdict)` for every stage row.
    pub fn stage_triples(&self) -> Vec<(String, String, String)> {
        self.rows
            .iter()
            .filter_map(|row| match row {
                CheckpointRow::Stage(row) => Some((
                    row.commit.clone(),
                    row.stage.clone(),
                    row.verdict.as_str().to_string(),
                )),
                CheckpointRow::Commit(_) => None,
            })
            .collect()
    }
}

impl RowSink for RecordingRows {
    fn append(&mut self, row: &CheckpointRow) -> Result<()> {
        self.rows.push(row.clone());
        Ok(())
    }
}

/// Records progress events as short strings.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    pub events: Vec<String>,
}

impl ProgressReporter for RecordingProgress {
    fn note(&mut self, line: &str) -> Result<()> {
        self.events.push(format!("note {line}"));
        Ok(())
    }

    fn commit_started(&mut self, header: &CommitHeader<'_>) -> Result<()> {
        self.events
            .push(format!("commit {} {}/{}", header.commit, header.index, header.total));
        Ok(())
    }

    fn commit_skipped(&mut self, commit: &str, reason: &str) -> Result<()> {
        self.events.push(format!("skipped {commit} {reason}"));
        Ok(())
    }

    fn stage_started(&mut self, stage: &str) -> Result<()> {
        self.events.push(format!("stage {stage}"));
        Ok(())
    }

    fn stage_finished(&mut self, result: &StageResult) -> Result<()> {
        self.events
            .push(format!("done {} {}", result.stage, result.verdict.as_str()));
        Ok(())
    }

    fn commit_finished(&mut self, result: &CommitResult) -> Result<()> {
        self.events.push(format!("finished {}", result.commit_id));
        Ok(())
    }
}

pub fn sample_commit(id: &str, message_short: &str) -> Commit {
    Commit {
        id: id.to_string(),
        message_short: message_short.to_string(),
        message: format!("{message_short}\n\nSigned-off-by: Dev <dev@example.com>"),
        patch: format!("diff --git a/{id}.c b/{id}.c\n+change for {id}\n"),
        parent_count: 1,
    }
}

/// Merge commit with no diff against its first parent.
pub fn empty_merge(id: &str) -> Commit {
    Commit {
        patch: String::new(),
        parent_count: 2,
        ..sample_commit(id, "Merge branch 'side'")
    }
}

pub fn classifying_stage(name: &str, ok: &str, fail: &str, policy: FoldPolicy) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        rules: Some(StageRules {
            ok: Regex::new(ok).unwrap_or_else(|err| panic!("ok pattern: {err}")),
            fail: Regex::new(fail).unwrap_or_else(|err| panic!("fail pattern: {err}")),
        }),
        policy,
        repair_prompt: "Invalid response ({{ retry }}/{{ max_retries }}):".to_string(),
        params: BackendParams {
            model: "test-model".to_string(),
            options: serde_json::Map::new(),
        },
    }
}

pub fn free_text_stage(name: &str, policy: FoldPolicy) -> StageSpec {
    StageSpec {
        rules: None,
        ..classifying_stage(name, "x", "y", policy)
    }
}

/// Throwaway git repository with a fixed identity.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create repo tempdir")?;
        let repo = Self { dir };
        repo.run_git(&["init", "-q"])?;
        repo.run_git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path(), Duration::from_secs(30))
    }

    /// Write `contents` to `path`, commit it, and return the new commit id.
    pub fn commit_file(&self, path: &str, contents: &str, message: &str) -> Result<String> {
        let full = self.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&full, contents).with_context(|| format!("write {}", full.display()))?;
        self.run_git(&["add", path])?;
        self.run_git(&["commit", "-q", "-m", message])?;
        self.head()
    }

    pub fn tag(&self, name: &str) -> Result<()> {
        self.run_git(&["tag", name]).map(|_| ())
    }

    pub fn head(&self) -> Result<String> {
        Ok(self.run_git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    pub fn run_git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args([
                "-c",
                "user.name=Patch Eval",
                "-c",
                "user.email=patcheval@example.com",
                "-c",
                "commit.gpgsign=false",
                "-c",
                "tag.gpgsign=false",
            ])
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Config TOML for a plan of classifying stages answering `BUGFIX`/`NOT`-style
/// pairs, rooted at `repo`.
pub fn sample_config_toml(repo: &Path) -> String {
    let mut stages = BTreeMap::new();
    stages.insert("bug-01", ("BUGFIX", "NOT"));
    stages.insert("stable-01", ("BACKPORT", "SKIP"));
    let mut toml = format!(
        "repo = {:?}\nplan = [\"bug-01\", \"stable-01\"]\nskip_commit_on_consecutive_fails = 1\n\n[backend]\nbackoff_ms = 1\n\n",
        repo.display().to_string()
    );
    for (name, (ok, fail)) in stages {
        toml.push_str(&format!(
            "[stages.{name}]\nok = \"{ok}\"\nfail = \"{fail}\"\nmodel = \"test-model\"\n\n"
        ));
    }
    toml.push_str("[[outcomes]]\nname = \"LTS\"\nstages = [\"bug-01\", \"stable-01\"]\n");
    toml
}

//! Run controller: walks the commit range, drives the plan runner per commit
//! and persists every result as soon as it exists.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::eta::{RunTotals, eta, format_duration};
use crate::core::types::{Plan, StageResult};
use crate::io::backend::{Backend, OllamaBackend};
use crate::io::checkpoint::{
    CheckpointRow, CheckpointWriter, CommitRow, ResumeIndex, RowSink, StageRow,
};
use crate::io::config::PatchevalConfig;
use crate::io::git::{CommitRange, CommitSource, Git, GitCommitSource};
use crate::io::log_dir::create_run_dir;
use crate::io::progress::{CommitHeader, ConsoleProgress, ProgressReporter};
use crate::io::prompt::PromptRenderer;
use crate::io::trace::{FileTrace, TraceSink};
use crate::plan::PlanRunner;
use crate::stage::{ExecutorSettings, StageExecutor};

/// Positional arguments of `patcheval run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    pub start: String,
    /// Defaults to `start`.
    pub end: Option<String>,
    /// Checkpoint of an interrupted run to continue.
    pub resume: Option<PathBuf>,
}

impl RunArgs {
    pub fn end_ref(&self) -> &str {
        self.end.as_deref().unwrap_or(&self.start)
    }
}

/// Destinations for everything a run produces.
pub struct RunSinks<'a> {
    pub trace: &'a mut dyn TraceSink,
    pub rows: &'a mut dyn RowSink,
    pub progress: &'a mut dyn ProgressReporter,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Commits in the range, including ones a previous run finished.
    pub commits_total: usize,
    /// Commits excluded because the checkpoint already closed them.
    pub already_recorded: usize,
    pub skipped: usize,
    pub early_exits: usize,
    /// Commits that could not be loaded; left open for a later resume.
    pub failed_loads: usize,
    pub totals: RunTotals,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!(
                "Processed {} of {} commits ({} already recorded, {} skipped, {} early exits, {} unreadable) in {}",
                self.totals.commits_done,
                self.commits_total,
                self.already_recorded,
                self.skipped,
                self.early_exits,
                self.failed_loads,
                format_duration(self.elapsed)
            ),
            format!(
                "Stages run: {}  in: {} B  out: {} B  prompt tokens: {}  response tokens: {}",
                self.totals.stages_run,
                self.totals.prompt_bytes,
                self.totals.response_bytes,
                self.totals.prompt_tokens,
                self.totals.response_tokens
            ),
        ]
    }
}

/// Process every commit of `source` not already closed in `resume`.
///
/// Each newly executed stage is appended to `sinks.rows` immediately, and a
/// commit row follows once the commit is finished. Returns early with
/// [`crate::cancel::Cancelled`] when `cancel` fires; rows written so far stay
/// valid.
#[instrument(skip_all)]
pub fn run_commits<B, S>(
    runner: &PlanRunner<'_, B>,
    source: &S,
    resume: &ResumeIndex,
    cancel: &CancelToken,
    sinks: RunSinks<'_>,
) -> Result<RunSummary>
where
    B: Backend + ?Sized,
    S: CommitSource + ?Sized,
{
    let RunSinks {
        trace,
        rows,
        progress,
    } = sinks;
    let started = Instant::now();
    let ids = source.commit_ids()?;
    let pending: Vec<&String> = ids.iter().filter(|id| !resume.is_complete(id)).collect();
    let mut summary = RunSummary {
        commits_total: ids.len(),
        already_recorded: ids.len() - pending.len(),
        ..RunSummary::default()
    };
    if summary.already_recorded > 0 {
        progress.note(&format!(
            "Resuming: {} commits already recorded, {} to go",
            summary.already_recorded,
            pending.len()
        ))?;
    }

    for (position, id) in pending.iter().enumerate() {
        cancel.check()?;
        let commit = match source.load(id) {
            Ok(commit) => commit,
            Err(err) => {
                warn!(commit = %id, error = %format!("{err:#}"), "failed to load commit");
                progress.commit_skipped(id, &format!("could not load: {err:#}"))?;
                summary.failed_loads += 1;
                continue;
            }
        };
        progress.commit_started(&CommitHeader {
            index: summary.already_recorded + position + 1,
            total: summary.commits_total,
            eta: eta(started.elapsed(), position, pending.len()),
            commit: &commit.id,
            message_short: &commit.message_short,
        })?;

        let mut persist = |stage: &StageResult| -> Result<()> {
            rows.append(&CheckpointRow::Stage(StageRow::new(
                &commit.id,
                &commit.message_short,
                stage,
            )))
        };
        let result = runner.run_commit(
            &commit,
            resume.recorded(id),
            trace,
            progress,
            &mut persist,
        )?;
        rows.append(&CheckpointRow::Commit(CommitRow::new(&result)))?;

        if result.skipped {
            summary.skipped += 1;
        }
        if result.early_exit {
            summary.early_exits += 1;
        }
        summary.totals.add_commit(&result);
    }

    summary.elapsed = started.elapsed();
    info!(
        commits = summary.totals.commits_done,
        skipped = summary.skipped,
        early_exits = summary.early_exits,
        "run finished"
    );
    Ok(summary)
}

/// Banner printed before the first commit.
pub fn header_lines(
    args: &RunArgs,
    range: &CommitRange,
    plan: &Plan,
    now_utc: DateTime<Utc>,
    now_local: DateTime<Local>,
) -> Vec<String> {
    vec![
        format!(
            "patcheval: walking between {} and {}",
            args.start,
            args.end_ref()
        ),
        format!(
            "Start commit: {}",
            range.start.as_deref().unwrap_or("(root)")
        ),
        format!("End commit:   {}", range.end),
        "Walk started at:".to_string(),
        format!("\t{}", now_utc.format("%Y-%m-%d %H:%M:%S UTC")),
        format!("\t{}", now_local.format("%Y-%m-%d %H:%M:%S %:z")),
        format!("Commit test plan: {}", plan.stage_names().join(", ")),
        format!("Skip commit on consecutive fails: {}", plan.skip_threshold),
        String::new(),
    ]
}

/// Wire configuration, git, backend and run artifacts together and run.
///
/// Reference resolution, template checks and the range walk all happen
/// before anything is written to disk.
pub fn run_from_config(
    cfg: &PatchevalConfig,
    args: &RunArgs,
    cancel: &CancelToken,
) -> Result<RunSummary> {
    let plan = cfg.compile_plan()?;
    let stage_names = plan.stage_names();
    let renderer = PromptRenderer::load_dir(&cfg.prompts_dir, &stage_names)?;
    renderer
        .ensure_templates(&stage_names)
        .with_context(|| format!("prompt templates in {}", cfg.prompts_dir.display()))?;

    let git = Git::new(&cfg.repo, Duration::from_secs(cfg.git_timeout_secs));
    let start = git.resolve(&args.start)?;
    let end = git.resolve(args.end_ref())?;
    let resume = match &args.resume {
        Some(path) => ResumeIndex::load(path)?,
        None => ResumeIndex::default(),
    };

    // Nothing is written until the range is known.
    let range = {
        let mut counting = ConsoleProgress::new(None)?;
        counting.busy("counting commits");
        git.walk(&start, &end)?
    };

    let run_dir = create_run_dir(&cfg.log_dir, Local::now())?;
    let checkpoint_path = args
        .resume
        .clone()
        .unwrap_or_else(|| run_dir.checkpoint_path.clone());
    let mut progress = ConsoleProgress::new(Some(&run_dir.log_path))?;
    let mut trace = FileTrace::open(&run_dir.trace_path)?;
    let mut rows = CheckpointWriter::open(&checkpoint_path)?;

    for line in header_lines(args, &range, &plan, Utc::now(), Local::now()) {
        progress.note(&line)?;
    }
    progress.note(&format!("Total commits: {}", range.ids.len()))?;
    progress.note(&format!("Logs: {}", run_dir.dir.display()))?;
    progress.note(&format!("Checkpoint: {}", checkpoint_path.display()))?;
    if args.resume.is_some() {
        progress.note(&format!(
            "Resume index: {} complete, {} partial",
            resume.finished_count(),
            resume.partial_count()
        ))?;
    }
    progress.note("")?;

    let backend = OllamaBackend::new(&cfg.backend);
    let settings = ExecutorSettings::from_config(cfg);
    let runner = PlanRunner::new(
        &plan,
        StageExecutor::new(&backend, &renderer, &settings, cancel),
    );
    let source = GitCommitSource::new(git, range);
    let summary = run_commits(
        &runner,
        &source,
        &resume,
        cancel,
        RunSinks {
            trace: &mut trace,
            rows: &mut rows,
            progress: &mut progress,
        },
    )?;

    progress.note("")?;
    for line in summary.lines() {
        progress.note(&line)?;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FoldPolicy;
    use crate::test_support::{
        MemoryCommitSource, RecordingProgress, RecordingRows, RecordingTrace, ScriptedBackend,
        ScriptedReply, cancel_on_call, classifying_stage, empty_merge, sample_commit,
    };
    use chrono::TimeZone;

    fn plan() -> Plan {
        Plan {
            stages: vec![
                classifying_stage("bug-01", "BUGFIX", "NOT", FoldPolicy::Any),
                classifying_stage("stable-01", "BACKPORT", "SKIP", FoldPolicy::Any),
            ],
            outcomes: Vec::new(),
            skip_threshold: 1,
            skip_merge_commits: true,
        }
    }

    fn renderer() -> PromptRenderer {
        PromptRenderer::from_templates([
            ("bug-01", "bug {{ commit }}"),
            ("stable-01", "stable {{ commit }}"),
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

    fn run(
        backend: &ScriptedBackend,
        source: &MemoryCommitSource,
        resume: &ResumeIndex,
        cancel: &CancelToken,
        rows: &mut RecordingRows,
        progress: &mut RecordingProgress,
    ) -> Result<RunSummary> {
        let plan = plan();
        let renderer = renderer();
        let settings = settings();
        let runner = PlanRunner::new(
            &plan,
            StageExecutor::new(backend, &renderer, &settings, cancel),
        );
        run_commits(
            &runner,
            source,
            resume,
            cancel,
            RunSinks {
                trace: &mut RecordingTrace::default(),
                rows,
                progress,
            },
        )
    }

    #[test]
    fn rows_follow_stage_order_and_close_each_commit() {
        let source = MemoryCommitSource::new(vec![
            sample_commit("c1", "fix"),
            empty_merge("c2"),
            sample_commit("c3", "feature"),
        ]);
        let backend = ScriptedBackend::by_prompt(vec![
            ("bug c1", "BUGFIX"),
            ("stable c1", "BACKPORT"),
            ("bug c3", "NOT"),
        ]);
        let mut rows = RecordingRows::default();
        let summary = run(
            &backend,
            &source,
            &ResumeIndex::default(),
            &CancelToken::new(),
            &mut rows,
            &mut RecordingProgress::default(),
        )
        .expect("run");

        let kinds: Vec<String> = rows
            .rows
            .iter()
            .map(|row| match row {
                CheckpointRow::Stage(row) => format!("{}/{}", row.commit, row.stage),
                CheckpointRow::Commit(row) => format!("{}:{:?}", row.commit, row.status),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "c1/bug-01",
                "c1/stable-01",
                "c1:Complete",
                "c2:Skipped",
                "c3/bug-01",
                "c3:Complete",
            ]
        );
        assert_eq!(summary.commits_total, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.early_exits, 1);
        assert_eq!(summary.totals.stages_run, 3);
    }

    #[test]
    fn completed_commits_are_excluded_on_resume() {
        let source = MemoryCommitSource::new(vec![
            sample_commit("c1", "fix"),
            sample_commit("c2", "fix again"),
        ]);
        let backend = ScriptedBackend::from_fn(|_| ScriptedReply::text("NOT"));
        let mut first = RecordingRows::default();
        run(
            &backend,
            &source,
            &ResumeIndex::default(),
            &CancelToken::new(),
            &mut first,
            &mut RecordingProgress::default(),
        )
        .expect("first run");

        let index = ResumeIndex::from_rows(&first.rows);
        let backend = ScriptedBackend::new(Vec::new());
        let mut second = RecordingRows::default();
        let mut progress = RecordingProgress::default();
        let summary = run(
            &backend,
            &source,
            &index,
            &CancelToken::new(),
            &mut second,
            &mut progress,
        )
        .expect("second run");
        assert!(second.rows.is_empty());
        assert_eq!(backend.call_count(), 0);
        assert_eq!(summary.already_recorded, 2);
        assert!(progress.events[0].contains("2 commits already recorded"));
    }

    #[test]
    fn cancellation_keeps_persisted_rows() {
        let source = MemoryCommitSource::new(vec![
            sample_commit("c1", "fix"),
            sample_commit("c2", "fix again"),
        ]);
        let cancel = CancelToken::new();
        let backend = cancel_on_call(cancel.clone(), 3, |request| {
            if request.prompt.starts_with("bug") {
                ScriptedReply::text("BUGFIX")
            } else {
                ScriptedReply::text("BACKPORT")
            }
        });
        let mut rows = RecordingRows::default();
        let err = run(
            &backend,
            &source,
            &ResumeIndex::default(),
            &cancel,
            &mut rows,
            &mut RecordingProgress::default(),
        )
        .unwrap_err();
        assert!(err.downcast_ref::<crate::cancel::Cancelled>().is_some());
        assert_eq!(rows.stage_triples().len(), 2);
        assert_eq!(rows.rows.len(), 3);
    }

    #[test]
    fn unreadable_commit_is_reported_and_left_open() {
        struct Flaky(MemoryCommitSource);
        impl CommitSource for Flaky {
            fn commit_ids(&self) -> Result<Vec<String>> {
                let mut ids = self.0.commit_ids()?;
                ids.insert(0, "gone".to_string());
                Ok(ids)
            }
            fn load(&self, id: &str) -> Result<crate::core::types::Commit> {
                self.0.load(id)
            }
        }
        let source = Flaky(MemoryCommitSource::new(vec![sample_commit("c1", "fix")]));
        let backend = ScriptedBackend::from_fn(|_| ScriptedReply::text("NOT"));
        let plan = plan();
        let renderer = renderer();
        let settings = settings();
        let cancel = CancelToken::new();
        let runner = PlanRunner::new(
            &plan,
            StageExecutor::new(&backend, &renderer, &settings, &cancel),
        );
        let mut rows = RecordingRows::default();
        let mut progress = RecordingProgress::default();
        let summary = run_commits(
            &runner,
            &source,
            &ResumeIndex::default(),
            &cancel,
            RunSinks {
                trace: &mut RecordingTrace::default(),
                rows: &mut rows,
                progress: &mut progress,
            },
        )
        .expect("run");
        assert_eq!(summary.failed_loads, 1);
        assert!(rows.rows.iter().all(|row| row.commit_id() != "gone"));
        assert!(progress.events[0].starts_with("skipped gone could not load"));
    }

    #[test]
    fn failed_walk_leaves_no_run_artifacts() {
        use crate::io::config::StageConfig;
        use crate::test_support::TestRepo;

        let repo = TestRepo::new().expect("repo");
        let base = repo.commit_file("a.c", "1\n", "one").expect("one");
        let middle = repo.commit_file("a.c", "2\n", "two").expect("two");
        repo.commit_file("a.c", "3\n", "three").expect("three");
        let (dir, file) = middle.split_at(2);
        std::fs::remove_file(repo.path().join(".git/objects").join(dir).join(file))
            .expect("drop middle commit object");

        let work = tempfile::tempdir().expect("workdir");
        std::fs::create_dir_all(work.path().join("prompts")).expect("prompts");
        std::fs::write(work.path().join("prompts/bug-01.md"), "bug {{ commit }}").expect("template");
        let checkpoint = work.path().join("old.jsonl");
        std::fs::write(&checkpoint, b"{\"kind\":\"sta").expect("torn checkpoint");

        let mut cfg = PatchevalConfig {
            repo: repo.path().to_path_buf(),
            prompts_dir: work.path().join("prompts"),
            log_dir: work.path().join("logs"),
            plan: vec!["bug-01".to_string()],
            ..PatchevalConfig::default()
        };
        cfg.stages.insert(
            "bug-01".to_string(),
            StageConfig {
                ok: Some("BUGFIX".to_string()),
                fail: Some("NOT".to_string()),
                model: "test-model".to_string(),
                ..StageConfig::default()
            },
        );
        let args = RunArgs {
            start: base,
            end: Some("main".to_string()),
            resume: Some(checkpoint.clone()),
        };

        assert!(run_from_config(&cfg, &args, &CancelToken::new()).is_err());
        assert!(!work.path().join("logs").exists());
        assert_eq!(
            std::fs::read(&checkpoint).expect("read checkpoint"),
            b"{\"kind\":\"sta"
        );
    }

    #[test]
    fn header_names_range_plan_and_threshold() {
        let args = RunArgs {
            start: "v6.1".to_string(),
            end: None,
            resume: None,
        };
        let range = CommitRange {
            start: None,
            end: "abc".to_string(),
            ids: vec!["abc".to_string()],
        };
        let utc = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).single().expect("time");
        let lines = header_lines(&args, &range, &plan(), utc, utc.with_timezone(&Local));
        assert_eq!(lines[0], "patcheval: walking between v6.1 and v6.1");
        assert_eq!(lines[1], "Start commit: (root)");
        assert_eq!(lines[4], "\t2024-03-09 12:00:00 UTC");
        assert_eq!(lines[6], "Commit test plan: bug-01, stable-01");
        assert_eq!(lines[7], "Skip commit on consecutive fails: 1");
    }
}

//! `patcheval report`: per-commit verdict table from a checkpoint log.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;

use crate::core::types::Verdict;
use crate::io::checkpoint::{CheckpointRow, CommitStatus, load_checkpoint};

const MESSAGE_WIDTH: usize = 50;
const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub commit: String,
    pub message_short: String,
    /// `None` while the commit has no closing row.
    pub status: Option<CommitStatus>,
    pub verdicts: BTreeMap<String, Verdict>,
    pub outcomes: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    /// Stage columns in first-seen order.
    pub stages: Vec<String>,
    pub outcomes: Vec<String>,
    /// Commits in first-seen order.
    pub lines: Vec<ReportLine>,
}

impl Report {
    pub fn from_rows(rows: &[CheckpointRow]) -> Self {
        let mut report = Report::default();
        let mut outcome_names = BTreeSet::new();
        for row in rows {
            let index = match report
                .lines
                .iter()
                .position(|line| line.commit == row.commit_id())
            {
                Some(index) => index,
                None => {
                    let message_short = match row {
                        CheckpointRow::Stage(row) => row.message_short.clone(),
                        CheckpointRow::Commit(row) => row.message_short.clone(),
                    };
                    report.lines.push(ReportLine {
                        commit: row.commit_id().to_string(),
                        message_short,
                        status: None,
                        verdicts: BTreeMap::new(),
                        outcomes: BTreeMap::new(),
                    });
                    report.lines.len() - 1
                }
            };
            let line = &mut report.lines[index];
            match row {
                CheckpointRow::Stage(stage) => {
                    if !report.stages.contains(&stage.stage) {
                        report.stages.push(stage.stage.clone());
                    }
                    line.verdicts.insert(stage.stage.clone(), stage.verdict);
                }
                CheckpointRow::Commit(commit) => {
                    line.status = Some(commit.status);
                    line.outcomes = commit.outcomes.clone();
                    outcome_names.extend(commit.outcomes.keys().cloned());
                }
            }
        }
        report.outcomes = outcome_names.into_iter().collect();
        report
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_rows(&load_checkpoint(path)?))
    }

    pub fn render(&self) -> String {
        let id_width = self
            .lines
            .iter()
            .map(|line| line.commit.len())
            .max()
            .unwrap_or(0)
            .max("id".len());
        let mut header = vec![
            format!("{:<id_width$}", "id"),
            format!("{:<width$}", "msg", width = MESSAGE_WIDTH + 3),
            format!("{:<8}", "status"),
        ];
        header.extend(self.stages.iter().chain(&self.outcomes).map(|name| column(name, name)));

        let mut out = String::new();
        let _ = writeln!(out, "{}", header.join(" ").trim_end());
        for line in &self.lines {
            let mut cells = vec![
                format!("{:<id_width$}", line.commit),
                format!(
                    "{:<width$}",
                    truncate_message(&line.message_short),
                    width = MESSAGE_WIDTH + 3
                ),
                format!("{:<8}", status_label(line.status)),
            ];
            for stage in &self.stages {
                let value = line
                    .verdicts
                    .get(stage)
                    .map_or(NOT_AVAILABLE, |verdict| verdict.as_str());
                cells.push(column(stage, value));
            }
            for outcome in &self.outcomes {
                let value = match line.outcomes.get(outcome) {
                    Some(true) => "true",
                    Some(false) => "false",
                    None => NOT_AVAILABLE,
                };
                cells.push(column(outcome, value));
            }
            let _ = writeln!(out, "{}", cells.join(" ").trim_end());
        }
        out.push('\n');
        for line in self.totals() {
            let _ = writeln!(out, "{line}");
        }
        out
    }

    /// Summary counts per stage verdict and per outcome.
    pub fn totals(&self) -> Vec<String> {
        let skipped = self
            .lines
            .iter()
            .filter(|line| line.status == Some(CommitStatus::Skipped))
            .count();
        let open = self.lines.iter().filter(|line| line.status.is_none()).count();
        let mut lines = vec![format!(
            "commits: {} (skipped {skipped}, unfinished {open})",
            self.lines.len()
        )];
        for stage in &self.stages {
            let count = |wanted: Verdict| {
                self.lines
                    .iter()
                    .filter(|line| line.verdicts.get(stage) == Some(&wanted))
                    .count()
            };
            lines.push(format!(
                "{stage}: ok {} fail {} unknown {}",
                count(Verdict::Ok),
                count(Verdict::Fail),
                count(Verdict::Unknown)
            ));
        }
        for outcome in &self.outcomes {
            let hits = self
                .lines
                .iter()
                .filter(|line| line.outcomes.get(outcome) == Some(&true))
                .count();
            lines.push(format!("{outcome}: {hits}"));
        }
        lines
    }
}

fn column(name: &str, value: &str) -> String {
    let width = name.len().max(7);
    format!("{value:<width$}")
}

fn status_label(status: Option<CommitStatus>) -> &'static str {
    match status {
        Some(CommitStatus::Complete) => "complete",
        Some(CommitStatus::Skipped) => "skipped",
        None => "partial",
    }
}

/// Cut `message` to the column width, marking the cut with `...`.
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MESSAGE_WIDTH {
        return message.to_string();
    }
    let mut cut: String = message.chars().take(MESSAGE_WIDTH).collect();
    cut.push_str("...");
    cut
}

//! Human-facing progress output.
//!
//! [`ConsoleProgress`] prints per-commit and per-stage lines to stdout and
//! mirrors them into the run's `log.txt`. While a stage waits on the backend
//! a spinner ticks on a background thread (terminals only).

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::eta::format_duration;
use crate::core::types::{CommitResult, StageResult};

const SPINNER_FRAMES: &[char] = &['|', '/', '-', '\\'];
const SPINNER_TICK: Duration = Duration::from_millis(120);

/// Position of a commit within the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitHeader<'a> {
    /// 1-based.
    pub index: usize,
    pub total: usize,
    pub eta: Option<Duration>,
    pub commit: &'a str,
    pub message_short: &'a str,
}

/// Receives run progress events. Implementations must not affect results.
pub trait ProgressReporter {
    /// Free-form line (run header, summary).
    fn note(&mut self, line: &str) -> Result<()>;
    fn commit_started(&mut self, header: &CommitHeader<'_>) -> Result<()>;
    fn commit_skipped(&mut self, commit: &str, reason: &str) -> Result<()>;
    fn stage_started(&mut self, stage: &str) -> Result<()>;
    fn stage_finished(&mut self, result: &StageResult) -> Result<()>;
    fn commit_finished(&mut self, result: &CommitResult) -> Result<()>;
}

pub fn format_commit_header(header: &CommitHeader<'_>) -> String {
    let eta = header
        .eta
        .map(format_duration)
        .unwrap_or_else(|| "--".to_string());
    format!(
        "[{}/{}] eta {} {} {}",
        header.index, header.total, eta, header.commit, header.message_short
    )
}

pub fn format_stage_line(result: &StageResult) -> String {
    let metrics = &result.metrics;
    // Free-text stages have no verdict worth showing; report the text size.
    let observation = if result.classifying {
        result.verdict.as_str().to_string()
    } else {
        format!("{:5} long", result.response.len())
    };
    let mut line = format!(
        " stage: {:>20} {:>10} {:5.2}s in: {:5} B out: {:5} B {:7.2} B/s",
        result.stage, observation,
        metrics.elapsed.as_secs_f64(),
        metrics.prompt_bytes,
        metrics.response_bytes,
        metrics.bytes_per_sec(),
    );
    if let (Some(tokens), Some(rate)) = (metrics.prompt_tokens, metrics.prompt_tokens_per_sec) {
        line.push_str(&format!(" | in: {tokens} tok {rate:.2} tok/s"));
    }
    if let (Some(tokens), Some(rate)) = (metrics.response_tokens, metrics.response_tokens_per_sec)
    {
        line.push_str(&format!(" out: {tokens} tok {rate:.2} tok/s"));
    }
    if result.retries > 0 {
        line.push_str(&format!(" retries: {}", result.retries));
    }
    line
}

pub fn format_commit_footer(result: &CommitResult) -> String {
    let mut line = String::from(" done");
    if result.early_exit {
        line.push_str(&format!(
            " (early exit after {} consecutive fails)",
            result.consecutive_fails
        ));
    }
    if !result.outcomes.is_empty() {
        let outcomes: Vec<String> = result
            .outcomes
            .iter()
            .map(|(name, value)| format!("{name}={}", if *value { "yes" } else { "no" }))
            .collect();
        line.push_str(&format!(" outcomes: {}", outcomes.join(" ")));
    }
    line
}

/// Background "still working" indicator. Stops on drop.
pub struct Spinner {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Spinner {
    pub fn start(label: String) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::spawn(move || {
            let mut stdout = io::stdout();
            let mut frame = 0usize;
            while flag.load(Ordering::SeqCst) {
                let _ = write!(
                    stdout,
                    "\r{} {label}",
                    SPINNER_FRAMES[frame % SPINNER_FRAMES.len()]
                );
                let _ = stdout.flush();
                frame += 1;
                thread::sleep(SPINNER_TICK);
            }
            let _ = write!(stdout, "\r{}\r", " ".repeat(label.len() + 2));
            let _ = stdout.flush();
        });
        Self {
            running,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stdout plus `log.txt` reporter.
pub struct ConsoleProgress {
    log: Option<BufWriter<File>>,
    interactive: bool,
    spinner: Option<Spinner>,
}

impl ConsoleProgress {
    pub fn new(log_path: Option<&Path>) -> Result<Self> {
        let log = match log_path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("open {}", path.display()))?;
                Some(BufWriter::new(file))
            }
            None => None,
        };
        Ok(Self {
            log,
            interactive: io::stdout().is_terminal(),
            spinner: None,
        })
    }

    /// Show the spinner with `label` until the next line is emitted.
    pub fn busy(&mut self, label: &str) {
        self.stop_spinner();
        if self.interactive {
            self.spinner = Some(Spinner::start(label.to_string()));
        }
    }

    fn stop_spinner(&mut self) {
        if let Some(mut spinner) = self.spinner.take() {
            spinner.stop();
        }
    }

    fn emit(&mut self, line: &str) -> Result<()> {
        self.stop_spinner();
        println!("{line}");
        if let Some(log) = self.log.as_mut() {
            writeln!(log, "{line}").context("write log.txt")?;
            log.flush().context("flush log.txt")?;
        }
        Ok(())
    }
}

impl ProgressReporter for ConsoleProgress {
    fn note(&mut self, line: &str) -> Result<()> {
        self.emit(line)
    }

    fn commit_started(&mut self, header: &CommitHeader<'_>) -> Result<()> {
        self.emit(&format_commit_header(header))
    }

    fn commit_skipped(&mut self, commit: &str, reason: &str) -> Result<()> {
        self.emit(&format!(" skipped {commit}: {reason}"))
    }

    fn stage_started(&mut self, stage: &str) -> Result<()> {
        self.busy(&format!("stage: {stage:>20} running"));
        Ok(())
    }

    fn stage_finished(&mut self, result: &StageResult) -> Result<()> {
        self.emit(&format_stage_line(result))
    }

    fn commit_finished(&mut self, result: &CommitResult) -> Result<()> {
        self.emit(&format_commit_footer(result))
    }
}

impl Drop for ConsoleProgress {
    fn drop(&mut self) {
        self.stop_spinner();
        if let Some(log) = self.log.as_mut() {
            let _ = log.flush();
        }
    }
}

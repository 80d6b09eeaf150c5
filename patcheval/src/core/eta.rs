//! Throughput accumulation and moving ETA for a run.

use std::time::Duration;

use crate::core::types::CommitResult;

/// Cumulative counters across the commits processed in this session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTotals {
    pub commits_done: usize,
    pub stages_run: usize,
    pub prompt_bytes: usize,
    pub response_bytes: usize,
    pub prompt_tokens: u64,
    pub response_tokens: u64,
}

impl RunTotals {
    pub fn add_commit(&mut self, result: &CommitResult) {
        self.commits_done += 1;
        for stage in result.stages() {
            self.stages_run += 1;
            self.prompt_bytes += stage.metrics.prompt_bytes;
            self.response_bytes += stage.metrics.response_bytes;
            self.prompt_tokens += stage.metrics.prompt_tokens.unwrap_or(0);
            self.response_tokens += stage.metrics.response_tokens.unwrap_or(0);
        }
    }
}

/// `elapsed / done * remaining`. `None` before the first commit completes.
pub fn eta(elapsed: Duration, done: usize, total: usize) -> Option<Duration> {
    if done == 0 {
        return None;
    }
    let remaining = total.saturating_sub(done) as f64;
    Some(Duration::from_secs_f64(
        elapsed.as_secs_f64() / done as f64 * remaining,
    ))
}

/// Render a duration as `HhMMmSSs` for progress lines.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

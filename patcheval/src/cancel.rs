//! Cooperative cancellation shared by the run controller and stage executor.
//!
//! A single token is threaded through the pipeline and checked at each
//! suspension point: before a backend call, while waiting on it, and during
//! backoff sleeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::warn;

/// Granularity of cancellable sleeps.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Returned (inside `anyhow::Error`) when the operator interrupted the run.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("interrupted by operator")]
pub struct Cancelled;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error with [`Cancelled`] if the token has fired.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(());
            };
            if remaining.is_zero() {
                return Ok(());
            }
            thread::sleep(remaining.min(POLL_INTERVAL));
        }
    }
}

/// Route SIGINT/SIGTERM into `token`. A second signal exits immediately.
pub fn install_signal_handler(token: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(crate::exit_codes::INTERRUPTED);
        }
        warn!("interrupt received, stopping after cleanup");
        token.cancel();
    })
    .context("install signal handler")
}

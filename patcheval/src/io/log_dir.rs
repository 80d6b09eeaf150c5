//! Per-run log directory `<log_dir>/<YYYY-mm-dd_HH-MM-SS>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::debug;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const CURRENT_LINK: &str = "_current";

pub const LOG_FILE: &str = "log.txt";
pub const TRACE_FILE: &str = "trace.log";
pub const CHECKPOINT_FILE: &str = "checkpoint.jsonl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    pub dir: PathBuf,
    pub log_path: PathBuf,
    pub trace_path: PathBuf,
    pub checkpoint_path: PathBuf,
}

impl RunDir {
    fn new(dir: PathBuf) -> Self {
        Self {
            log_path: dir.join(LOG_FILE),
            trace_path: dir.join(TRACE_FILE),
            checkpoint_path: dir.join(CHECKPOINT_FILE),
            dir,
        }
    }
}

/// Create a fresh run directory under `root` named after `started`, and point
/// `root/_current` at it.
pub fn create_run_dir(root: &Path, started: DateTime<Local>) -> Result<RunDir> {
    fs::create_dir_all(root).with_context(|| format!("create log dir {}", root.display()))?;
    let stamp = started.format(TIMESTAMP_FORMAT).to_string();
    let mut name = stamp.clone();
    let mut suffix = 1;
    while root.join(&name).exists() {
        name = format!("{stamp}-{suffix}");
        suffix += 1;
    }
    let dir = root.join(&name);
    fs::create_dir(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
    link_current(root, &name)?;
    debug!(dir = %dir.display(), "run directory created");
    Ok(RunDir::new(dir))
}

#[cfg(unix)]
fn link_current(root: &Path, name: &str) -> Result<()> {
    let link = root.join(CURRENT_LINK);
    if fs::symlink_metadata(&link).is_ok() {
        fs::remove_file(&link).with_context(|| format!("remove {}", link.display()))?;
    }
    std::os::unix::fs::symlink(name, &link)
        .with_context(|| format!("link {} -> {name}", link.display()))
}

#[cfg(not(unix))]
fn link_current(_root: &Path, _name: &str) -> Result<()> {
    Ok(())
}

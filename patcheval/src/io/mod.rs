//! Side-effecting adapters: config, git, backend, templates and run artifacts.

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod git;
pub mod log_dir;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod trace;

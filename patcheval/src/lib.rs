//! Commit classification through an ordered plan of language-model stages.
//!
//! Each commit of a git range is fed through configured stages, each asking a
//! local model a yes/no-style question about the patch. The crate keeps the
//! same split as its CLI:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, verdict folding,
//!   failure streaks, ETA). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (config, git, inference backend,
//!   templates, checkpoint/trace/progress output).
//!
//! Orchestration modules ([`stage`], [`plan`], [`run`], [`report`]) combine the
//! two to implement the CLI commands.

pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod report;
pub mod run;
pub mod stage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

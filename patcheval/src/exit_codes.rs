//! Stable exit codes for patcheval CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Configuration, usage, ref resolution or other fatal error.
pub const INVALID: i32 = 1;
/// The operator interrupted the run (SIGINT/SIGTERM).
pub const INTERRUPTED: i32 = 130;

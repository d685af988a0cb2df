//! Stable exit codes for the `campaign-exec` CLI.

/// Every task finished.
pub const OK: i32 = 0;
/// Invalid task file, config or flags, or another setup error.
pub const INVALID: i32 = 1;
/// A task failed.
pub const TASK_FAILED: i32 = 2;
/// A task ran past the configured timeout.
pub const TIMEOUT: i32 = 3;

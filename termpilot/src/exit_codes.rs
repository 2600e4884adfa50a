//! Stable exit codes for the `termpilot` binary.

/// The goal completed or the operator stopped the run.
pub const OK: i32 = 0;
/// Configuration was invalid (bad cwd, unknown shell, malformed patterns).
pub const INVALID: i32 = 1;
/// The run hit `max_steps` before the goal completed.
pub const STEP_LIMIT: i32 = 2;
/// The model API or operator channel failed.
pub const MODEL_ERROR: i32 = 3;

//! Stable exit codes for planner CLI commands.

/// Command succeeded (a skipped sandbox counts as success).
pub const OK: i32 = 0;
/// Command failed due to invalid config, recipe or plan, or any other error.
pub const INVALID: i32 = 1;
/// The user declined to install eval-time dependencies.
pub const DECLINED: i32 = 2;
/// Sandbox validation ran and failed, or refused an incomplete plan.
pub const SANDBOX_FAILED: i32 = 3;

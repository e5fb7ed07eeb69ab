//! Recipe planner: turns declarative install recipes into executable plans.
//!
//! A recipe is an ordered list of actions. Composite actions (e.g.
//! `pipx_install`) need a toolchain on the controlling host to decompose into
//! primitive steps; primitive steps in turn need tools inside whatever
//! environment eventually runs them. The planner resolves both tiers:
//!
//! - **eval-time** dependencies are installed on the host (consent-gated) so
//!   decomposition can proceed;
//! - **install-time** dependencies are embedded in the plan as a forest of
//!   dependency recipes so an isolated sandbox can install them first.
//!
//! The crate keeps the usual split:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, plan invariants,
//!   cycle tracking, sandbox output markers). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, processes, host tools,
//!   installer, recipe directory, plan files, container runtimes).
//!
//! Orchestration modules ([`generate`], [`sandbox`], [`orchestrate`]) combine
//! the two to implement the CLI commands.

pub mod actions;
pub mod core;
pub mod exit_codes;
pub mod generate;
pub mod io;
pub mod logging;
pub mod orchestrate;
pub mod plan;
pub mod recipe;
pub mod sandbox;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

//! I/O adapters for planner commands.

pub mod config;
pub mod host;
pub mod installer;
pub mod plan_store;
pub mod process;
pub mod recipe_store;
pub mod runtime;

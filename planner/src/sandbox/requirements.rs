//! Container requirements derived from a plan.

use std::time::Duration;

use crate::io::runtime::{NetworkMode, ResourceLimits};
use crate::plan::Plan;

/// Image for plans that only fetch and unpack binaries.
pub const DEFAULT_IMAGE: &str = "debian:bookworm-slim";
/// Image for plans that build from source or use ecosystem installers.
pub const BUILD_IMAGE: &str = "ubuntu:22.04";

/// Actions that compile and need the build profile even when offline.
const BUILD_ACTIONS: &[&str] = &["configure_make", "cmake_build", "cargo_build", "go_build"];

pub fn default_limits() -> ResourceLimits {
    ResourceLimits {
        memory: "2g".to_string(),
        cpus: 2,
        pids: 100,
        timeout: Duration::from_secs(2 * 60),
    }
}

pub fn build_limits() -> ResourceLimits {
    ResourceLimits {
        memory: "4g".to_string(),
        cpus: 4,
        pids: 500,
        timeout: Duration::from_secs(15 * 60),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRequirements {
    pub network: NetworkMode,
    pub image: String,
    pub limits: ResourceLimits,
}

impl SandboxRequirements {
    /// Look at every step, dependency steps included.
    ///
    /// Network-requiring steps switch to the build profile with host
    /// networking. Build actions do too, since the image needs its build
    /// toolchain fetched.
    pub fn from_plan(plan: &Plan) -> Self {
        let needs_network = plan.all_steps().any(|step| step.requires_network);
        let builds = plan
            .all_steps()
            .any(|step| BUILD_ACTIONS.contains(&step.action.as_str()));

        if needs_network || builds {
            Self {
                network: NetworkMode::Host,
                image: BUILD_IMAGE.to_string(),
                limits: build_limits(),
            }
        } else {
            Self {
                network: NetworkMode::None,
                image: DEFAULT_IMAGE.to_string(),
                limits: default_limits(),
            }
        }
    }
}

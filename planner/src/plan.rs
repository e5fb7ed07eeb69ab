//! Execution plan data model.
//!
//! A [`Plan`] is the output of plan generation: an ordered list of primitive
//! steps plus a forest of [`DependencyNode`]s the executing environment must
//! install first. Plans are produced once and never patched; a changed recipe
//! means a regenerated plan.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::invariants;
use crate::recipe::{Params, Recipe, Verify};

/// Only plan format readers and writers agree on.
pub const PLAN_FORMAT_VERSION: u32 = 2;

/// Target platform for a plan (`os`/`arch`, e.g. `linux/amd64`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Platform of the running host, using the `darwin`/`amd64`/`arm64` spelling.
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self::new(os, arch)
    }

    pub fn is_linux(&self) -> bool {
        self.os == "linux"
    }

    pub fn is_darwin(&self) -> bool {
        self.os == "darwin" || self.os == "macos"
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// A primitive step with frozen parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedStep {
    pub action: String,
    pub params: Params,
    /// Tools that must be installed before this step runs.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub install_deps: BTreeSet<String>,
    /// Recipe-level action this step was decomposed from.
    pub origin: String,
    pub deterministic: bool,
    #[serde(default)]
    pub requires_network: bool,
}

/// A resolved install-time dependency and its own subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyNode {
    pub name: String,
    pub recipe: Recipe,
    pub steps: Vec<ResolvedStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub format_version: u32,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecosystem: Option<String>,
    pub version: String,
    pub platform: Platform,
    pub recipe_hash: String,
    /// True when every step, dependency steps included, is deterministic.
    pub deterministic: bool,
    pub steps: Vec<ResolvedStep>,
    #[serde(default)]
    pub dependencies: Vec<DependencyNode>,
    /// Install-time dependencies that could not be embedded.
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<Verify>,
}

/// A step paired with its stable id, in execution order.
#[derive(Debug, Clone, Copy)]
pub struct SequencedStep<'a> {
    pub owner: &'a str,
    pub index: usize,
    pub step: &'a ResolvedStep,
}

impl SequencedStep<'_> {
    pub fn id(&self) -> String {
        step_id(self.owner, self.index)
    }
}

/// Stable step identity: `"{owner}#{index}"`.
pub fn step_id(owner: &str, index: usize) -> String {
    format!("{owner}#{index}")
}

impl Plan {
    /// Install-time dependencies with no embedded node (plan-level `missing`
    /// plus anything a step names that the forest lacks).
    pub fn missing_install_deps(&self) -> Vec<String> {
        invariants::missing_install_deps(self)
    }

    pub fn is_complete(&self) -> bool {
        self.missing_install_deps().is_empty()
    }

    /// Every dependency name embedded anywhere in the forest.
    pub fn embedded_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        collect_names(&self.dependencies, &mut names);
        names
    }

    /// Forest nodes in installation order: children before parents, each
    /// name once.
    pub fn installation_order(&self) -> Vec<&DependencyNode> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        for node in &self.dependencies {
            post_order(node, &mut seen, &mut order);
        }
        order
    }

    /// All steps the executing environment runs: dependency steps first (in
    /// installation order), then the tool's own steps.
    pub fn sequenced_steps(&self) -> Vec<SequencedStep<'_>> {
        let mut out = Vec::new();
        for node in self.installation_order() {
            for (index, step) in node.steps.iter().enumerate() {
                out.push(SequencedStep {
                    owner: &node.name,
                    index,
                    step,
                });
            }
        }
        for (index, step) in self.steps.iter().enumerate() {
            out.push(SequencedStep {
                owner: &self.tool,
                index,
                step,
            });
        }
        out
    }

    /// Every step in the plan, main and dependency steps alike.
    pub fn all_steps(&self) -> impl Iterator<Item = &ResolvedStep> {
        let mut steps: Vec<&ResolvedStep> = self.steps.iter().collect();
        let mut stack: Vec<&DependencyNode> = self.dependencies.iter().collect();
        while let Some(node) = stack.pop() {
            steps.extend(node.steps.iter());
            stack.extend(node.dependencies.iter());
        }
        steps.into_iter()
    }
}

impl DependencyNode {
    /// Search this subtree (self included) for `name`.
    pub fn find(&self, name: &str) -> Option<&DependencyNode> {
        if self.name == name {
            return Some(self);
        }
        self.dependencies.iter().find_map(|child| child.find(name))
    }
}

fn collect_names(nodes: &[DependencyNode], names: &mut BTreeSet<String>) {
    for node in nodes {
        names.insert(node.name.clone());
        collect_names(&node.dependencies, names);
    }
}

fn post_order<'a>(
    node: &'a DependencyNode,
    seen: &mut BTreeSet<&'a str>,
    order: &mut Vec<&'a DependencyNode>,
) {
    if seen.contains(node.name.as_str()) {
        return;
    }
    for child in &node.dependencies {
        post_order(child, seen, order);
    }
    if seen.insert(node.name.as_str()) {
        order.push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Recipe;

    fn step(action: &str) -> ResolvedStep {
        ResolvedStep {
            action: action.to_string(),
            params: Params::new(),
            install_deps: BTreeSet::new(),
            origin: action.to_string(),
            deterministic: true,
            requires_network: false,
        }
    }

    fn node(name: &str, children: Vec<DependencyNode>) -> DependencyNode {
        DependencyNode {
            name: name.to_string(),
            recipe: Recipe::new(name, Vec::new()),
            steps: vec![step("download_file")],
            dependencies: children,
        }
    }

    fn plan(forest: Vec<DependencyNode>) -> Plan {
        Plan {
            format_version: PLAN_FORMAT_VERSION,
            tool: "tool".to_string(),
            ecosystem: None,
            version: "latest".to_string(),
            platform: Platform::new("linux", "amd64"),
            recipe_hash: String::new(),
            deterministic: true,
            steps: vec![step("install_binaries")],
            dependencies: forest,
            missing: Vec::new(),
            verify: None,
        }
    }

    #[test]
    fn installation_order_is_post_order_and_deduplicated() {
        let shared = node("zlib", Vec::new());
        let forest = vec![
            node("openssl", vec![shared.clone()]),
            node("curl", vec![shared, node("nghttp2", Vec::new())]),
        ];
        let plan = plan(forest);
        let names: Vec<&str> = plan
            .installation_order()
            .iter()
            .map(|node| node.name.as_str())
            .collect();
        assert_eq!(names, vec!["zlib", "openssl", "nghttp2", "curl"]);
    }

    #[test]
    fn sequenced_steps_put_dependencies_first() {
        let plan = plan(vec![node("python-standalone", Vec::new())]);
        let ids: Vec<String> = plan.sequenced_steps().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["python-standalone#0", "tool#0"]);
        assert_eq!(plan.sequenced_steps()[1].step.action, "install_binaries");
    }

    #[test]
    fn embedded_names_cover_nested_nodes() {
        let plan = plan(vec![node("d", vec![node("e", Vec::new())])]);
        let names: Vec<String> = plan.embedded_names().into_iter().collect();
        assert_eq!(names, vec!["d".to_string(), "e".to_string()]);
        assert_eq!(plan.all_steps().count(), 3);
    }

    #[test]
    fn platform_display_uses_slash() {
        assert_eq!(Platform::new("darwin", "arm64").to_string(), "darwin/arm64");
        assert!(Platform::new("darwin", "arm64").is_darwin());
        assert!(!Platform::new("darwin", "arm64").is_linux());
    }
}

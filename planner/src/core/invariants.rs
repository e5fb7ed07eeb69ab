//! Plan invariants not expressible via JSON Schema.

use std::collections::BTreeSet;

use crate::plan::{DependencyNode, PLAN_FORMAT_VERSION, Plan};

/// Install-time dependencies a plan names but does not embed.
///
/// Combines the plan's recorded `missing` list with any step (main or
/// dependency) whose `install_deps` name something absent from the forest.
/// Sorted and deduplicated; empty means the plan is complete.
pub fn missing_install_deps(plan: &Plan) -> Vec<String> {
    let embedded = plan.embedded_names();
    let mut missing: BTreeSet<String> = plan.missing.iter().cloned().collect();
    for step in plan.all_steps() {
        for dep in &step.install_deps {
            if !embedded.contains(dep) {
                missing.insert(dep.clone());
            }
        }
    }
    missing.into_iter().collect()
}

/// Check structural invariants of a loaded plan:
/// - supported `format_version`
/// - no duplicate names among a node's direct dependencies
/// - no node lists itself among its descendants
pub fn validate_invariants(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.format_version != PLAN_FORMAT_VERSION {
        errors.push(format!(
            "unsupported format_version {} (expected {PLAN_FORMAT_VERSION})",
            plan.format_version
        ));
    }
    check_siblings(&plan.tool, &plan.dependencies, &mut errors);
    for node in &plan.dependencies {
        let mut ancestors = vec![plan.tool.as_str()];
        check_node(node, &mut ancestors, &mut errors);
    }
    errors
}

fn check_siblings(owner: &str, nodes: &[DependencyNode], errors: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    for node in nodes {
        if !seen.insert(node.name.as_str()) {
            errors.push(format!("{owner}: duplicate dependency '{}'", node.name));
        }
    }
}

fn check_node<'a>(node: &'a DependencyNode, ancestors: &mut Vec<&'a str>, errors: &mut Vec<String>) {
    if ancestors.contains(&node.name.as_str()) {
        let mut chain = ancestors.clone();
        chain.push(&node.name);
        errors.push(format!("dependency cycle: {}", chain.join(" -> ")));
        return;
    }
    check_siblings(&node.name, &node.dependencies, errors);
    ancestors.push(&node.name);
    for child in &node.dependencies {
        check_node(child, ancestors, errors);
    }
    ancestors.pop();
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::plan::{Platform, ResolvedStep};
    use crate::recipe::{Params, Recipe};

    fn step(deps: &[&str]) -> ResolvedStep {
        ResolvedStep {
            action: "pip_exec".to_string(),
            params: Params::new(),
            install_deps: deps.iter().map(|d| d.to_string()).collect::<BTreeSet<_>>(),
            origin: "pipx_install".to_string(),
            deterministic: false,
            requires_network: true,
        }
    }

    fn node(name: &str, children: Vec<DependencyNode>) -> DependencyNode {
        DependencyNode {
            name: name.to_string(),
            recipe: Recipe::new(name, Vec::new()),
            steps: Vec::new(),
            dependencies: children,
        }
    }

    fn plan(steps: Vec<ResolvedStep>, forest: Vec<DependencyNode>) -> Plan {
        Plan {
            format_version: PLAN_FORMAT_VERSION,
            tool: "ruff".to_string(),
            ecosystem: Some("pypi".to_string()),
            version: "latest".to_string(),
            platform: Platform::new("linux", "amd64"),
            recipe_hash: String::new(),
            deterministic: false,
            steps,
            dependencies: forest,
            missing: Vec::new(),
            verify: None,
        }
    }

    #[test]
    fn embedded_dependency_makes_plan_complete() {
        let plan = plan(
            vec![step(&["python-standalone"])],
            vec![node("python-standalone", Vec::new())],
        );
        assert!(missing_install_deps(&plan).is_empty());
        assert!(validate_invariants(&plan).is_empty());
    }

    #[test]
    fn unembedded_dependency_is_reported_once() {
        let mut plan = plan(vec![step(&["python-standalone"]), step(&["python-standalone"])], Vec::new());
        plan.missing = vec!["python-standalone".to_string()];
        assert_eq!(missing_install_deps(&plan), vec!["python-standalone".to_string()]);
    }

    #[test]
    fn nested_dependency_counts_as_embedded() {
        let mut dep = node("d", vec![node("e", Vec::new())]);
        dep.steps.push(step(&["e"]));
        let plan = plan(vec![step(&["d"])], vec![dep]);
        assert!(missing_install_deps(&plan).is_empty());
    }

    #[test]
    fn invariants_flag_version_duplicates_and_cycles() {
        let mut plan = plan(
            Vec::new(),
            vec![
                node("a", vec![node("b", vec![node("a", Vec::new())])]),
                node("a", Vec::new()),
            ],
        );
        plan.format_version = 1;
        let errors = validate_invariants(&plan);
        assert!(errors.iter().any(|e| e.contains("format_version 1")));
        assert!(errors.iter().any(|e| e.contains("duplicate dependency 'a'")));
        assert!(errors.iter().any(|e| e.contains("ruff -> a -> b -> a")));
    }
}

//! Deterministic dependency classification of recipe steps.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::actions::Action;
use crate::plan::Platform;
use crate::recipe::Params;

/// Step parameter replacing an action's install-time dependencies.
pub const DEPENDENCIES_PARAM: &str = "dependencies";
/// Step parameter extending an action's install-time dependencies.
pub const EXTRA_DEPENDENCIES_PARAM: &str = "extra_dependencies";

/// Eval-time and install-time dependency names of one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepSets {
    pub eval_time: BTreeSet<String>,
    pub install_time: BTreeSet<String>,
}

/// Classify a step's dependencies.
///
/// - Eval-time deps are the action's declared set.
/// - Install-time deps are the declared set plus the platform-specific set for
///   the target OS, unless the step overrides them:
///   - `dependencies = [...]` replaces the set;
///   - `extra_dependencies = [...]` extends it.
/// - `name@version` entries contribute only their name.
pub fn classify(action: &dyn Action, params: &Params, platform: &Platform) -> DepSets {
    let declared = action.deps();

    let eval_time = declared.eval_time.iter().map(|s| s.to_string()).collect();

    let mut install_time: BTreeSet<String> = match string_list(params, DEPENDENCIES_PARAM) {
        Some(replacement) => replacement
            .iter()
            .map(|dep| dependency_name(dep).to_string())
            .collect(),
        None => {
            let mut set: BTreeSet<String> =
                declared.install_time.iter().map(|s| s.to_string()).collect();
            if platform.is_linux() {
                set.extend(declared.linux_install_time.iter().map(|s| s.to_string()));
            }
            if platform.is_darwin() {
                set.extend(declared.darwin_install_time.iter().map(|s| s.to_string()));
            }
            set
        }
    };

    if let Some(extra) = string_list(params, EXTRA_DEPENDENCIES_PARAM) {
        install_time.extend(extra.iter().map(|dep| dependency_name(dep).to_string()));
    }

    DepSets {
        eval_time,
        install_time,
    }
}

/// True if the step replaces the action's install-time dependencies.
pub fn overrides_install_deps(params: &Params) -> bool {
    string_list(params, DEPENDENCIES_PARAM).is_some()
}

/// Name part of a `name@version` dependency entry.
pub fn dependency_name(entry: &str) -> &str {
    match entry.split_once('@') {
        Some((name, _)) => name.trim(),
        None => entry.trim(),
    }
}

fn string_list<'a>(params: &'a Params, key: &str) -> Option<Vec<&'a str>> {
    let Value::Array(items) = params.get(key)? else {
        return None;
    };
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .collect(),
    )
}

//! Action registry: maps action type names to implementations.
//!
//! Every action declares its dependency requirements up front. Composite
//! actions additionally expose a decomposition rule turning one recipe step
//! into lower-level steps; primitive actions are executed as-is by the step
//! runner inside the sandbox.

mod composites;
mod primitives;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use serde_json::Value;

pub use composites::{DownloadArchive, EcosystemInstall, GithubArchive};
pub use primitives::Primitive;

use crate::io::host::HostTools;
use crate::plan::Platform;
use crate::recipe::{Params, Recipe, Step};

/// Declared dependency sets of an action type. Immutable per type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionDeps {
    /// Needed inside the executing environment before the step runs.
    pub install_time: &'static [&'static str],
    /// Needed on the planning host to decompose the action.
    pub eval_time: &'static [&'static str],
    pub linux_install_time: &'static [&'static str],
    pub darwin_install_time: &'static [&'static str],
}

impl ActionDeps {
    pub const EMPTY: ActionDeps = ActionDeps {
        install_time: &[],
        eval_time: &[],
        linux_install_time: &[],
        darwin_install_time: &[],
    };
}

pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;

    fn deps(&self) -> ActionDeps {
        ActionDeps::EMPTY
    }

    /// Identical inputs yield identical results.
    fn deterministic(&self) -> bool {
        false
    }

    fn requires_network(&self) -> bool {
        false
    }

    fn as_composite(&self) -> Option<&dyn Composite> {
        None
    }
}

/// Decomposition rule of a composite action.
pub trait Composite: Send + Sync {
    /// Expand `params` into lower-level steps. Called only once the action's
    /// eval-time dependencies are satisfied on the host.
    fn decompose(&self, ctx: &EvalContext<'_>, params: &Params) -> Result<Vec<Step>>;
}

/// What a composite may consult while decomposing.
pub struct EvalContext<'a> {
    pub platform: &'a Platform,
    pub recipe: &'a Recipe,
    pub host: &'a dyn HostTools,
}

impl EvalContext<'_> {
    /// Version to freeze: step `version`, then recipe version, then `latest`.
    pub fn version(&self, params: &Params) -> String {
        params
            .get("version")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .or(self.recipe.metadata.version.as_deref())
            .unwrap_or("latest")
            .to_string()
    }

    /// Host version of an eval-time toolchain.
    pub fn toolchain_version(&self, tool: &str) -> Option<String> {
        self.host.installed_version(tool)
    }
}

/// Name-indexed set of actions.
#[derive(Default)]
pub struct ActionRegistry {
    actions: BTreeMap<&'static str, Box<dyn Action>>,
}

static BUILTIN: LazyLock<ActionRegistry> = LazyLock::new(ActionRegistry::with_builtins);

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared registry of the built-in catalogue.
    pub fn builtin() -> &'static ActionRegistry {
        &BUILTIN
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for primitive in primitives::BUILTIN {
            registry.register(*primitive);
        }
        registry.register(DownloadArchive);
        registry.register(GithubArchive);
        for composite in composites::ECOSYSTEM {
            registry.register(*composite);
        }
        registry
    }

    /// Add an action, replacing any existing one with the same name.
    pub fn register<A: Action + 'static>(&mut self, action: A) {
        self.actions.insert(action.name(), Box::new(action));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Action> {
        self.actions.get(name).map(|action| &**action)
    }
}

/// Required string parameter of a composite.
pub(crate) fn require_str<'a>(action: &str, params: &'a Params, key: &str) -> Result<&'a str> {
    match params.get(key).and_then(Value::as_str) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("{action} requires a '{key}' parameter"),
    }
}

/// Optional list-of-strings parameter.
pub(crate) fn str_list(params: &Params, key: &str) -> Option<Vec<String>> {
    let items = params.get(key)?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

//! Plan generation: decomposition plus two-tier dependency resolution.
//!
//! Steps are processed in recipe order:
//! 1. classify the step's action;
//! 2. for composites, satisfy eval-time deps on the host (installer, with
//!    consent) and decompose, recursively for nested composites;
//! 3. attach install-time deps to each resulting primitive and embed every
//!    such dep as a [`DependencyNode`] resolved through the recipe loader.
//!
//! Generation either returns a whole plan or an error; there are no partial
//! plans. Without a loader, install-time deps are recorded in `missing` and
//! the plan is incomplete.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::actions::{Action, ActionRegistry, EvalContext};
use crate::core::classifier::{self, DEPENDENCIES_PARAM, DepSets, EXTRA_DEPENDENCIES_PARAM};
use crate::core::resolution::{ResolutionStack, format_cycle};
use crate::io::host::HostTools;
use crate::io::installer::{DependencyInstaller, InstallError};
use crate::io::recipe_store::{LoadError, RecipeLoader};
use crate::plan::{DependencyNode, PLAN_FORMAT_VERSION, Plan, Platform, ResolvedStep};
use crate::recipe::{Recipe, Step};

/// Composites may expand into composites at most this many levels deep.
pub const MAX_DECOMPOSITION_DEPTH: usize = 8;

/// Suggested manual install command when no installer is configured.
pub const DEFAULT_INSTALL_HINT: &str = "tsuku install";

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(
        "missing eval-time dependencies for '{action}': {} (install with: {hint} {})",
        .deps.join(", "),
        .deps.join(" ")
    )]
    MissingEvalDeps {
        action: String,
        deps: Vec<String>,
        hint: String,
    },
    #[error("declined to install eval-time dependencies: {}", .deps.join(", "))]
    DeclinedEvalDeps { deps: Vec<String> },
    #[error("could not ask for consent to install eval-time dependencies: {}", .deps.join(", "))]
    Consent {
        deps: Vec<String>,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to install eval-time dependency '{tool}'")]
    InstallFailed {
        tool: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("dependency cycle: {}", format_cycle(.chain))]
    Cycle { chain: Vec<String> },
    #[error("unknown dependency '{name}' (required by '{required_by}')")]
    UnknownDependency { name: String, required_by: String },
    #[error("invalid recipe for dependency '{name}'")]
    InvalidDependencyRecipe {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("unknown action '{action}' in recipe '{recipe}'")]
    UnknownAction { action: String, recipe: String },
    #[error("failed to decompose '{action}' in recipe '{recipe}'")]
    Decomposition {
        action: String,
        recipe: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to hash recipe '{recipe}'")]
    Hash {
        recipe: String,
        #[source]
        source: serde_json::Error,
    },
}

impl GenerateError {
    pub fn is_declined(&self) -> bool {
        matches!(self, GenerateError::DeclinedEvalDeps { .. })
    }
}

/// Collaborators and policy for one generation call.
#[derive(Clone, Copy)]
pub struct PlanOptions<'a> {
    pub auto_accept_eval_deps: bool,
    pub host: &'a dyn HostTools,
    pub installer: Option<&'a dyn DependencyInstaller>,
    pub loader: Option<&'a dyn RecipeLoader>,
    pub registry: &'a ActionRegistry,
    pub install_hint: &'a str,
}

impl<'a> PlanOptions<'a> {
    /// Built-in actions, no installer, no loader, no auto-accept.
    pub fn new(host: &'a dyn HostTools) -> Self {
        Self {
            auto_accept_eval_deps: false,
            host,
            installer: None,
            loader: None,
            registry: ActionRegistry::builtin(),
            install_hint: DEFAULT_INSTALL_HINT,
        }
    }

    pub fn with_installer(mut self, installer: &'a dyn DependencyInstaller) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn with_loader(mut self, loader: &'a dyn RecipeLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_registry(mut self, registry: &'a ActionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_install_hint(mut self, hint: &'a str) -> Self {
        self.install_hint = hint;
        self
    }

    pub fn auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept_eval_deps = auto_accept;
        self
    }
}

/// Generate a plan for `recipe` targeting `platform`.
#[instrument(skip_all, fields(tool = %recipe.name(), platform = %platform))]
pub fn generate_plan(
    recipe: &Recipe,
    platform: &Platform,
    options: &PlanOptions<'_>,
) -> Result<Plan, GenerateError> {
    let recipe_hash = recipe
        .content_hash()
        .map_err(|source| GenerateError::Hash {
            recipe: recipe.name().to_string(),
            source,
        })?;

    let mut generator = Generator::new(*options, platform);
    generator.stack.push(recipe.name());
    let planned = generator.plan_recipe(recipe)?;
    generator.stack.pop();

    let deterministic = planned.steps.iter().all(|step| step.deterministic)
        && planned.dependencies.iter().all(node_deterministic);
    let plan = Plan {
        format_version: PLAN_FORMAT_VERSION,
        tool: recipe.name().to_string(),
        ecosystem: recipe.metadata.ecosystem.clone(),
        version: recipe
            .metadata
            .version
            .clone()
            .unwrap_or_else(|| "latest".to_string()),
        platform: platform.clone(),
        recipe_hash,
        deterministic,
        steps: planned.steps,
        dependencies: planned.dependencies,
        missing: generator.missing.into_iter().collect(),
        verify: recipe.verify.clone(),
    };
    info!(
        steps = plan.steps.len(),
        dependencies = plan.dependencies.len(),
        complete = plan.missing.is_empty(),
        "plan generated"
    );
    Ok(plan)
}

fn node_deterministic(node: &DependencyNode) -> bool {
    node.steps.iter().all(|step| step.deterministic)
        && node.dependencies.iter().all(node_deterministic)
}

/// Decomposed steps and embedded forest of one recipe.
struct Planned {
    steps: Vec<ResolvedStep>,
    dependencies: Vec<DependencyNode>,
}

/// State for one generation call; discarded afterwards.
struct Generator<'a> {
    options: PlanOptions<'a>,
    platform: &'a Platform,
    /// Eval-time deps known to be present on the host.
    satisfied: BTreeSet<String>,
    /// Fully resolved dependency nodes by name.
    memo: BTreeMap<String, DependencyNode>,
    stack: ResolutionStack,
    /// Install-time deps that could not be embedded (no loader).
    missing: BTreeSet<String>,
}

impl<'a> Generator<'a> {
    fn new(options: PlanOptions<'a>, platform: &'a Platform) -> Self {
        Self {
            options,
            platform,
            satisfied: BTreeSet::new(),
            memo: BTreeMap::new(),
            stack: ResolutionStack::new(),
            missing: BTreeSet::new(),
        }
    }

    fn action(&self, recipe: &Recipe, name: &str) -> Result<&'a dyn Action, GenerateError> {
        let registry: &'a ActionRegistry = self.options.registry;
        registry
            .get(name)
            .ok_or_else(|| GenerateError::UnknownAction {
                action: name.to_string(),
                recipe: recipe.name().to_string(),
            })
    }

    fn plan_recipe(&mut self, recipe: &Recipe) -> Result<Planned, GenerateError> {
        let owner = recipe.name();
        let mut steps = Vec::new();
        let mut forest = Vec::new();

        for step in &recipe.steps {
            let action = self.action(recipe, &step.action)?;
            let deps = classifier::classify(action, &step.params, self.platform);
            let replaced = classifier::overrides_install_deps(&step.params);

            for (primitive, primitive_action) in self.expand(recipe, step, action, &deps, 0)? {
                let mut install_deps = deps.install_time.clone();
                if !replaced {
                    install_deps.extend(
                        classifier::classify(primitive_action, &primitive.params, self.platform)
                            .install_time,
                    );
                }
                for dep in &install_deps {
                    self.embed(owner, dep, &mut forest)?;
                }

                let mut params = primitive.params;
                params.remove(DEPENDENCIES_PARAM);
                params.remove(EXTRA_DEPENDENCIES_PARAM);
                debug!(
                    owner,
                    index = steps.len(),
                    action = %primitive.action,
                    origin = %step.action,
                    "resolved step"
                );
                steps.push(ResolvedStep {
                    action: primitive.action,
                    params,
                    install_deps,
                    origin: step.action.clone(),
                    deterministic: primitive_action.deterministic(),
                    requires_network: primitive_action.requires_network(),
                });
            }
        }

        Ok(Planned {
            steps,
            dependencies: forest,
        })
    }

    /// Expand a step into primitives, decomposing composites recursively.
    fn expand(
        &mut self,
        recipe: &Recipe,
        step: &Step,
        action: &'a dyn Action,
        deps: &DepSets,
        depth: usize,
    ) -> Result<Vec<(Step, &'a dyn Action)>, GenerateError> {
        let Some(composite) = action.as_composite() else {
            return Ok(vec![(step.clone(), action)]);
        };
        if depth >= MAX_DECOMPOSITION_DEPTH {
            return Err(GenerateError::Decomposition {
                action: step.action.clone(),
                recipe: recipe.name().to_string(),
                source: anyhow!("nested decomposition exceeds {MAX_DECOMPOSITION_DEPTH} levels"),
            });
        }

        self.satisfy_eval_deps(action.name(), &deps.eval_time)?;

        let ctx = EvalContext {
            platform: self.platform,
            recipe,
            host: self.options.host,
        };
        let children = composite
            .decompose(&ctx, &step.params)
            .map_err(|source| GenerateError::Decomposition {
                action: step.action.clone(),
                recipe: recipe.name().to_string(),
                source,
            })?;
        debug!(action = %step.action, children = children.len(), depth, "decomposed");

        let mut primitives = Vec::new();
        for child in &children {
            let child_action = self.action(recipe, &child.action)?;
            let child_deps = classifier::classify(child_action, &child.params, self.platform);
            primitives.extend(self.expand(recipe, child, child_action, &child_deps, depth + 1)?);
        }
        Ok(primitives)
    }

    fn satisfy_eval_deps(
        &mut self,
        action: &str,
        required: &BTreeSet<String>,
    ) -> Result<(), GenerateError> {
        let mut unmet = Vec::new();
        for dep in required {
            if self.satisfied.contains(dep) {
                continue;
            }
            if self.options.host.is_installed(dep) {
                self.satisfied.insert(dep.clone());
                continue;
            }
            unmet.push(dep.clone());
        }
        if unmet.is_empty() {
            return Ok(());
        }

        let Some(installer) = self.options.installer else {
            return Err(GenerateError::MissingEvalDeps {
                action: action.to_string(),
                deps: unmet,
                hint: self.options.install_hint.to_string(),
            });
        };

        info!(action, deps = ?unmet, auto_accept = self.options.auto_accept_eval_deps, "eval-time dependencies missing");
        installer
            .ensure(&unmet, self.options.auto_accept_eval_deps)
            .map_err(|err| match err {
                InstallError::Declined { tools } => GenerateError::DeclinedEvalDeps { deps: tools },
                InstallError::Consent { tools, source } => GenerateError::Consent {
                    deps: tools,
                    source,
                },
                InstallError::Failed { tool, source } => {
                    GenerateError::InstallFailed { tool, source }
                }
            })?;
        self.satisfied.extend(unmet);
        Ok(())
    }

    /// Add `name` to `forest` unless already present.
    fn embed(
        &mut self,
        owner: &str,
        name: &str,
        forest: &mut Vec<DependencyNode>,
    ) -> Result<(), GenerateError> {
        if forest.iter().any(|node| node.name == name) {
            return Ok(());
        }
        let Some(loader) = self.options.loader else {
            if self.missing.insert(name.to_string()) {
                warn!(dependency = name, owner, "no recipe loader; plan will be incomplete");
            }
            return Ok(());
        };
        let node = self.resolve_node(loader, name, owner)?;
        forest.push(node);
        Ok(())
    }

    fn resolve_node(
        &mut self,
        loader: &'a dyn RecipeLoader,
        name: &str,
        required_by: &str,
    ) -> Result<DependencyNode, GenerateError> {
        if self.stack.contains(name) {
            return Err(GenerateError::Cycle {
                chain: self.stack.cycle_through(name),
            });
        }
        if let Some(node) = self.memo.get(name) {
            debug!(dependency = name, "dependency already resolved");
            return Ok(node.clone());
        }

        let recipe = loader.load(name).map_err(|err| match err {
            LoadError::NotFound { .. } => GenerateError::UnknownDependency {
                name: name.to_string(),
                required_by: required_by.to_string(),
            },
            LoadError::Invalid { source, .. } => GenerateError::InvalidDependencyRecipe {
                name: name.to_string(),
                source,
            },
        })?;
        debug!(dependency = name, required_by, depth = self.stack.depth(), "resolving dependency");

        self.stack.push(name);
        let planned = self.plan_recipe(&recipe);
        self.stack.pop();
        let planned = planned?;

        let node = DependencyNode {
            name: name.to_string(),
            recipe,
            steps: planned.steps,
            dependencies: planned.dependencies,
        };
        self.memo.insert(name.to_string(), node.clone());
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::actions::{ActionDeps, Composite, Primitive};
    use crate::recipe::Params;
    use crate::test_support::InMemoryHost;

    /// Composite that expands into itself forever.
    struct Recursive;

    impl Action for Recursive {
        fn name(&self) -> &'static str {
            "recursive"
        }

        fn as_composite(&self) -> Option<&dyn Composite> {
            Some(self)
        }
    }

    impl Composite for Recursive {
        fn decompose(&self, _ctx: &EvalContext<'_>, _params: &Params) -> Result<Vec<Step>> {
            Ok(vec![Step::new("recursive")])
        }
    }

    fn linux() -> Platform {
        Platform::new("linux", "amd64")
    }

    #[test]
    fn runaway_decomposition_is_bounded() {
        let mut registry = ActionRegistry::with_builtins();
        registry.register(Recursive);
        let host = InMemoryHost::new();
        let options = PlanOptions::new(&host).with_registry(&registry);
        let recipe = Recipe::new("loop", vec![Step::new("recursive")]);

        let err = generate_plan(&recipe, &linux(), &options).expect_err("depth");
        assert!(matches!(err, GenerateError::Decomposition { .. }));
        assert!(format!("{:#}", anyhow::Error::from(err)).contains("exceeds 8 levels"));
    }

    #[test]
    fn unknown_action_is_named() {
        let host = InMemoryHost::new();
        let options = PlanOptions::new(&host);
        let recipe = Recipe::new("tool", vec![Step::new("teleport")]);
        let err = generate_plan(&recipe, &linux(), &options).expect_err("unknown");
        assert_eq!(err.to_string(), "unknown action 'teleport' in recipe 'tool'");
    }

    #[test]
    fn missing_eval_deps_without_installer_suggest_command() {
        let host = InMemoryHost::new();
        let options = PlanOptions::new(&host);
        let recipe = Recipe::new("ruff", vec![Step::new("pipx_install").param("package", "ruff")]);
        let err = generate_plan(&recipe, &linux(), &options).expect_err("missing");
        assert_eq!(
            err.to_string(),
            "missing eval-time dependencies for 'pipx_install': python-standalone \
             (install with: tsuku install python-standalone)"
        );
        assert!(!err.is_declined());
    }

    #[test]
    fn override_params_are_not_frozen_into_steps() {
        let mut registry = ActionRegistry::with_builtins();
        registry.register(Primitive::new("build").with_deps(ActionDeps {
            install_time: &["make"],
            ..ActionDeps::EMPTY
        }));
        let host = InMemoryHost::new();
        let options = PlanOptions::new(&host).with_registry(&registry);
        let recipe = Recipe::new(
            "tool",
            vec![
                Step::new("build")
                    .param("dependencies", serde_json::json!(["cmake@3.29"]))
                    .param("target", "all"),
            ],
        );

        let plan = generate_plan(&recipe, &linux(), &options).expect("plan");
        let step = &plan.steps[0];
        assert_eq!(step.install_deps.iter().collect::<Vec<_>>(), vec!["cmake"]);
        assert!(!step.params.contains_key("dependencies"));
        assert_eq!(step.params.get("target"), Some(&serde_json::json!("all")));
        assert_eq!(plan.missing, vec!["cmake".to_string()]);
    }
}

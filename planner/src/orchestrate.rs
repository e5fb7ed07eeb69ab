//! Build orchestration: recipe synthesis, plan generation, sandbox validation.
//!
//! The orchestrator holds no state between requests; every collaborator is
//! borrowed for its lifetime.

use anyhow::{Result, bail};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::generate::{GenerateError, PlanOptions, generate_plan};
use crate::io::process::RunControl;
use crate::io::recipe_store::{LoadError, RecipeLoader};
use crate::io::runtime::RuntimeDetector;
use crate::plan::{Plan, Platform};
use crate::recipe::Recipe;
use crate::sandbox::{SandboxExecutor, SandboxOutcome};

/// Ecosystem name served straight from the recipe directory.
pub const REGISTRY_ECOSYSTEM: &str = "registry";

/// Produces a recipe for a package from some source ecosystem.
pub trait RecipeBuilder: Send + Sync {
    fn synthesize(&self, ecosystem: &str, package: &str) -> Result<Recipe>;
}

/// Serves hand-written recipes through a [`RecipeLoader`].
///
/// `registry` accepts any recipe; other ecosystems only match recipes whose
/// metadata names that ecosystem.
pub struct RegistryBuilder<L> {
    loader: L,
}

impl<L: RecipeLoader> RegistryBuilder<L> {
    pub fn new(loader: L) -> Self {
        Self { loader }
    }
}

impl<L: RecipeLoader> RecipeBuilder for RegistryBuilder<L> {
    fn synthesize(&self, ecosystem: &str, package: &str) -> Result<Recipe> {
        let recipe = match self.loader.load(package) {
            Ok(recipe) => recipe,
            Err(LoadError::NotFound { .. }) => {
                bail!("no recipe for '{package}' in the registry")
            }
            Err(err) => return Err(err.into()),
        };
        if ecosystem != REGISTRY_ECOSYSTEM
            && recipe.metadata.ecosystem.as_deref() != Some(ecosystem)
        {
            bail!(
                "recipe '{package}' is for ecosystem '{}', not '{ecosystem}'",
                recipe.metadata.ecosystem.as_deref().unwrap_or(REGISTRY_ECOSYSTEM)
            );
        }
        Ok(recipe)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub ecosystem: String,
    pub package: String,
    pub platform: Platform,
    /// Run sandbox validation on the generated plan.
    pub validate: bool,
}

impl BuildRequest {
    pub fn new(ecosystem: impl Into<String>, package: impl Into<String>, platform: Platform) -> Self {
        Self {
            ecosystem: ecosystem.into(),
            package: package.into(),
            platform,
            validate: true,
        }
    }

    pub fn plan_only(mut self) -> Self {
        self.validate = false;
        self
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to synthesize recipe for {ecosystem}:{package}")]
    Synthesize {
        ecosystem: String,
        package: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Generate(#[from] GenerateError),
}

impl BuildError {
    pub fn is_declined(&self) -> bool {
        matches!(self, BuildError::Generate(err) if err.is_declined())
    }
}

/// Result of one build request. A failed generation leaves `plan` empty; a
/// skipped or disabled sandbox leaves `sandbox` as reported.
#[derive(Debug)]
pub struct BuildReport {
    pub plan: Option<Plan>,
    pub sandbox: Option<SandboxOutcome>,
    pub error: Option<BuildError>,
}

impl BuildReport {
    fn failed(error: BuildError) -> Self {
        Self {
            plan: None,
            sandbox: None,
            error: Some(error),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.sandbox.as_ref().is_none_or(SandboxOutcome::is_ok)
    }
}

pub struct Orchestrator<'a, B, D> {
    builder: B,
    options: PlanOptions<'a>,
    sandbox: Option<&'a SandboxExecutor<D>>,
}

impl<'a, B: RecipeBuilder, D: RuntimeDetector> Orchestrator<'a, B, D> {
    pub fn new(builder: B, options: PlanOptions<'a>) -> Self {
        Self {
            builder,
            options,
            sandbox: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox: &'a SandboxExecutor<D>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    #[instrument(skip_all, fields(ecosystem = %request.ecosystem, package = %request.package))]
    pub fn build(&self, request: &BuildRequest, control: &RunControl) -> BuildReport {
        let recipe = match self.builder.synthesize(&request.ecosystem, &request.package) {
            Ok(recipe) => recipe,
            Err(source) => {
                warn!(err = %format!("{source:#}"), "recipe synthesis failed");
                return BuildReport::failed(BuildError::Synthesize {
                    ecosystem: request.ecosystem.clone(),
                    package: request.package.clone(),
                    source,
                });
            }
        };
        self.build_recipe(&recipe, request, control)
    }

    /// Generate and validate a plan for an already synthesized recipe.
    pub fn build_recipe(
        &self,
        recipe: &Recipe,
        request: &BuildRequest,
        control: &RunControl,
    ) -> BuildReport {
        let plan = match generate_plan(recipe, &request.platform, &self.options) {
            Ok(plan) => plan,
            Err(err) => return BuildReport::failed(err.into()),
        };

        let sandbox = match self.sandbox {
            Some(executor) if request.validate => Some(executor.validate(&plan, control)),
            _ => None,
        };
        info!(
            tool = %plan.tool,
            sandbox = %sandbox.as_ref().map_or_else(|| "disabled".to_string(), ToString::to_string),
            "build finished"
        );
        BuildReport {
            plan: Some(plan),
            sandbox,
            error: None,
        }
    }
}

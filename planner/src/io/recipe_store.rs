//! Dependency recipe lookup by name.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::recipe::Recipe;

static RECIPE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9._+-]*$").expect("recipe name pattern is valid")
});

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("recipe '{name}' not found")]
    NotFound { name: String },
    #[error("invalid recipe '{name}'")]
    Invalid {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Resolves a dependency name to the recipe that installs it.
pub trait RecipeLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<Recipe, LoadError>;
}

impl<T: RecipeLoader + ?Sized> RecipeLoader for &T {
    fn load(&self, name: &str) -> Result<Recipe, LoadError> {
        (**self).load(name)
    }
}

pub fn is_valid_recipe_name(name: &str) -> bool {
    RECIPE_NAME.is_match(name)
}

/// Read and parse a recipe file, checking the basic shape.
pub fn load_recipe_file(path: &Path) -> Result<Recipe> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let recipe =
        Recipe::from_toml_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_recipe(&recipe).with_context(|| format!("validate {}", path.display()))?;
    Ok(recipe)
}

fn validate_recipe(recipe: &Recipe) -> Result<()> {
    if !is_valid_recipe_name(recipe.name()) {
        bail!("invalid recipe name '{}'", recipe.name());
    }
    if recipe.steps.is_empty() {
        bail!("recipe '{}' has no steps", recipe.name());
    }
    if let Some(step) = recipe.steps.iter().find(|s| s.action.trim().is_empty()) {
        bail!("recipe '{}' has a step with an empty action: {step:?}", recipe.name());
    }
    Ok(())
}

/// Loads `<dir>/<name>.toml`.
#[derive(Debug, Clone)]
pub struct DirRecipeLoader {
    dir: PathBuf,
}

impl DirRecipeLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.toml"))
    }
}

impl RecipeLoader for DirRecipeLoader {
    fn load(&self, name: &str) -> Result<Recipe, LoadError> {
        if !is_valid_recipe_name(name) {
            return Err(LoadError::Invalid {
                name: name.to_string(),
                source: anyhow!("recipe names must match {}", RECIPE_NAME.as_str()),
            });
        }
        let path = self.path_for(name);
        if !path.is_file() {
            return Err(LoadError::NotFound {
                name: name.to_string(),
            });
        }
        debug!(recipe = name, path = %path.display(), "loading recipe");
        let recipe = load_recipe_file(&path).map_err(|source| LoadError::Invalid {
            name: name.to_string(),
            source,
        })?;
        if recipe.name() != name {
            return Err(LoadError::Invalid {
                name: name.to_string(),
                source: anyhow!(
                    "{} declares name '{}'",
                    path.display(),
                    recipe.name()
                ),
            });
        }
        Ok(recipe)
    }
}

//! Recipe model: the declarative input to plan generation.
//!
//! Recipes are authored as TOML:
//!
//! ```toml
//! [metadata]
//! name = "ruff"
//! ecosystem = "pypi"
//!
//! [[steps]]
//! action = "pipx_install"
//! package = "ruff"
//! ```
//!
//! Step parameters are flattened into the step table and kept opaque; only
//! the action that consumes them interprets their meaning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Opaque step parameters, ordered for stable serialization and hashing.
pub type Params = BTreeMap<String, Value>;

/// One installable unit: metadata plus an ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub metadata: Metadata,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<Verify>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    /// Source ecosystem the recipe was synthesized from (e.g. `pypi`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecosystem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A single recipe step wrapping one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub action: String,
    #[serde(flatten)]
    pub params: Params,
}

/// Post-install verification command carried through to the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verify {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl Recipe {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            metadata: Metadata {
                name: name.into(),
                ecosystem: None,
                version: None,
                description: None,
            },
            steps,
            verify: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Parse a recipe from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// SHA-256 (hex) of the canonical JSON form, recorded as plan provenance.
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

impl Step {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Params::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

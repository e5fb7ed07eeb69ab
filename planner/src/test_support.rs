//! Test doubles for the planner's collaborator seams.
//!
//! Compiled for unit tests and, through the `test-support` feature, for the
//! crate's own integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::io::host::HostTools;
use crate::io::installer::{Consent, DependencyInstaller, InstallError};
use crate::io::process::RunControl;
use crate::io::recipe_store::{LoadError, RecipeLoader};
use crate::core::markers;
use crate::io::runtime::{ContainerRuntime, ContainerSpec, RunOutput, RuntimeDetector};
use crate::recipe::{Recipe, Step};

/// Build a recipe with the given name and steps.
pub fn recipe(name: &str, steps: Vec<Step>) -> Recipe {
    Recipe::new(name, steps)
}

/// Host tool state kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryHost {
    tools: Mutex<BTreeMap<String, String>>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(self, tool: &str, version: &str) -> Self {
        self.install(tool, version);
        self
    }

    pub fn install(&self, tool: &str, version: &str) {
        self.tools
            .lock()
            .expect("host lock")
            .insert(tool.to_string(), version.to_string());
    }
}

impl HostTools for InMemoryHost {
    fn installed_version(&self, tool: &str) -> Option<String> {
        self.tools.lock().expect("host lock").get(tool).cloned()
    }
}

/// One recorded `ensure` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureCall {
    pub deps: Vec<String>,
    pub auto_accept: bool,
}

/// Records every `ensure` call; optionally declines or fails, and installs
/// into an [`InMemoryHost`] on success.
#[derive(Debug, Default)]
pub struct RecordingInstaller<'a> {
    host: Option<&'a InMemoryHost>,
    decline: bool,
    fail: Option<String>,
    calls: Mutex<Vec<EnsureCall>>,
}

impl<'a> RecordingInstaller<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installing_into(mut self, host: &'a InMemoryHost) -> Self {
        self.host = Some(host);
        self
    }

    /// Behave like a user answering "no" without auto-accept.
    pub fn declining(mut self) -> Self {
        self.decline = true;
        self
    }

    pub fn failing_on(mut self, tool: &str) -> Self {
        self.fail = Some(tool.to_string());
        self
    }

    pub fn calls(&self) -> Vec<EnsureCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Every dependency passed to `ensure`, in call order.
    pub fn requested(&self) -> Vec<String> {
        self.calls().into_iter().flat_map(|call| call.deps).collect()
    }
}

impl DependencyInstaller for RecordingInstaller<'_> {
    fn ensure(&self, deps: &[String], auto_accept: bool) -> Result<(), InstallError> {
        self.calls.lock().expect("calls lock").push(EnsureCall {
            deps: deps.to_vec(),
            auto_accept,
        });
        if self.decline && !auto_accept {
            return Err(InstallError::Declined {
                tools: deps.to_vec(),
            });
        }
        for dep in deps {
            if self.fail.as_deref() == Some(dep.as_str()) {
                return Err(InstallError::Failed {
                    tool: dep.clone(),
                    source: anyhow!("download failed"),
                });
            }
            if let Some(host) = self.host {
                host.install(dep, "1.0.0");
            }
        }
        Ok(())
    }
}

/// Consent with a fixed answer that records prompts and notices.
#[derive(Debug, Default)]
pub struct ScriptedConsent {
    accept: bool,
    prompts: Mutex<Vec<Vec<String>>>,
    notices: Mutex<Vec<String>>,
}

impl ScriptedConsent {
    pub fn accepting() -> Self {
        Self {
            accept: true,
            ..Self::default()
        }
    }

    pub fn declining() -> Self {
        Self::default()
    }

    pub fn prompts(&self) -> Vec<Vec<String>> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().expect("notices lock").clone()
    }
}

impl Consent for ScriptedConsent {
    fn confirm(&self, tools: &[String]) -> Result<bool> {
        self.prompts.lock().expect("prompts lock").push(tools.to_vec());
        Ok(self.accept)
    }

    fn notice(&self, message: &str) {
        self.notices
            .lock()
            .expect("notices lock")
            .push(message.to_string());
    }
}

/// Recipes served from memory, counting loads per name.
#[derive(Debug, Default)]
pub struct MapRecipeLoader {
    recipes: BTreeMap<String, Recipe>,
    loads: Mutex<BTreeMap<String, usize>>,
}

impl MapRecipeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, recipe: Recipe) -> Self {
        self.recipes.insert(recipe.name().to_string(), recipe);
        self
    }

    pub fn load_count(&self, name: &str) -> usize {
        self.loads
            .lock()
            .expect("loads lock")
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl RecipeLoader for MapRecipeLoader {
    fn load(&self, name: &str) -> Result<Recipe, LoadError> {
        *self
            .loads
            .lock()
            .expect("loads lock")
            .entry(name.to_string())
            .or_default() += 1;
        self.recipes
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound {
                name: name.to_string(),
            })
    }
}

/// What a [`ScriptedRuntime`] saw during one run.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub spec: ContainerSpec,
    /// `sandbox.sh` as mounted into the container.
    pub script: String,
    /// `plan.json` as mounted into the container.
    pub plan_json: String,
    /// Time budget left when the run started.
    pub budget: Option<Duration>,
    pub cancelled_at_start: bool,
}

/// Container runtime returning queued outputs instead of starting anything.
///
/// Workspace files are captured during `run`, since the executor removes the
/// workspace afterwards. With an empty queue every run succeeds after
/// printing the completion marker.
#[derive(Debug, Default)]
pub struct ScriptedRuntime {
    outputs: Mutex<VecDeque<RunOutput>>,
    runs: Mutex<Vec<RecordedRun>>,
    fail_to_start: bool,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(self, output: RunOutput) -> Self {
        self.outputs.lock().expect("outputs lock").push_back(output);
        self
    }

    /// Every run errors as if the runtime client could not be started.
    pub fn failing_to_start() -> Self {
        Self {
            fail_to_start: true,
            ..Self::default()
        }
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().expect("runs lock").clone()
    }
}

impl ContainerRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run(&self, spec: &ContainerSpec, control: &RunControl) -> Result<RunOutput> {
        if self.fail_to_start {
            return Err(anyhow!("runtime client not found"));
        }
        let workspace = spec
            .mounts
            .iter()
            .find(|mount| mount.target == crate::sandbox::WORKSPACE_DIR)
            .map(|mount| mount.source.clone())
            .ok_or_else(|| anyhow!("workspace not mounted"))?;
        self.runs.lock().expect("runs lock").push(RecordedRun {
            spec: spec.clone(),
            script: fs::read_to_string(workspace.join("sandbox.sh"))?,
            plan_json: fs::read_to_string(workspace.join("plan.json"))?,
            budget: control.remaining(),
            cancelled_at_start: control.cancel.is_cancelled(),
        });
        let queued = self.outputs.lock().expect("outputs lock").pop_front();
        Ok(queued.unwrap_or_else(|| run_output(Some(0), "@@complete\n")))
    }
}

/// Detector returning a fixed runtime, or none.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDetector {
    runtime: Option<Arc<ScriptedRuntime>>,
}

impl ScriptedDetector {
    pub fn with_runtime(runtime: Arc<ScriptedRuntime>) -> Self {
        Self {
            runtime: Some(runtime),
        }
    }

    /// A host without any container runtime.
    pub fn none() -> Self {
        Self::default()
    }
}

impl RuntimeDetector for ScriptedDetector {
    fn detect(&self) -> Option<Arc<dyn ContainerRuntime>> {
        self.runtime
            .clone()
            .map(|runtime| runtime as Arc<dyn ContainerRuntime>)
    }
}

pub fn run_output(exit_code: Option<i32>, stdout: &str) -> RunOutput {
    RunOutput {
        exit_code,
        stdout: stdout.to_string(),
        markers: markers::trace(stdout),
        ..RunOutput::default()
    }
}

/// Write a placeholder step runner binary into `dir`.
pub fn fake_step_runner(dir: &Path) -> PathBuf {
    let path = dir.join("step-runner");
    fs::write(&path, "#!/bin/sh\nexit 0\n").expect("write step runner");
    path
}

/// Write an executable stand-in for a container runtime CLI into `dir`.
///
/// Every invocation appends its arguments to `<dir>/runtime.log`.
/// `--version` succeeds, `rm` does nothing else, and `run` executes
/// `run_body` as shell.
pub fn fake_runtime_cli(dir: &Path, run_body: &str) -> PathBuf {
    let path = dir.join("fake-runtime");
    let log = dir.join("runtime.log");
    let script = format!(
        "#!/bin/sh\n\
         echo \"$*\" >> '{log}'\n\
         case \"$1\" in\n\
         --version) echo 'fake-runtime 1.0' ;;\n\
         rm) ;;\n\
         run)\n{run_body}\n;;\n\
         esac\n",
        log = log.display(),
    );
    fs::write(&path, script).expect("write fake runtime");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake runtime");
    path
}

/// Arguments of every call made to a [`fake_runtime_cli`] in `dir`.
pub fn runtime_calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("runtime.log"))
        .map(|log| log.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

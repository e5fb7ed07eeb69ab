//! Recipe planner CLI.
//!
//! Generates installation plans from recipes, validates plans inside a
//! container sandbox, and runs both end to end for a package.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use planner::exit_codes;
use planner::generate::{PlanOptions, generate_plan};
use planner::io::config::{DEFAULT_CONFIG_PATH, PlannerConfig, load_config};
use planner::io::host::ToolsDir;
use planner::io::installer::{CommandToolInstall, HostInstaller, StdioConsent};
use planner::io::plan_store::{load_plan, write_plan};
use planner::io::process::RunControl;
use planner::io::recipe_store::{DirRecipeLoader, RecipeLoader, load_recipe_file};
use planner::io::runtime::ProbeDetector;
use planner::logging;
use planner::orchestrate::{BuildRequest, Orchestrator, RegistryBuilder};
use planner::plan::{Plan, Platform};
use planner::recipe::Recipe;
use planner::sandbox::{SandboxExecutor, SandboxFailure, SandboxOutcome, SandboxSettings};

#[derive(Parser)]
#[command(
    name = "planner",
    version,
    about = "Turn install recipes into self-contained plans and validate them in a sandbox"
)]
struct Cli {
    /// Config file (defaults apply when it does not exist).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct TargetArgs {
    /// Target OS (defaults to the host's).
    #[arg(long)]
    os: Option<String>,
    /// Target architecture (defaults to the host's).
    #[arg(long)]
    arch: Option<String>,
}

impl TargetArgs {
    fn platform(&self) -> Platform {
        let host = Platform::host();
        Platform::new(
            self.os.clone().unwrap_or(host.os),
            self.arch.clone().unwrap_or(host.arch),
        )
    }
}

#[derive(Subcommand)]
enum Command {
    /// Generate a plan for a recipe (name in the recipe directory, or a `.toml` path).
    Plan {
        recipe: String,
        #[command(flatten)]
        target: TargetArgs,
        /// Install missing eval-time dependencies without asking.
        #[arg(long)]
        install_deps: bool,
        /// Write the plan here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a plan file inside a container sandbox.
    Validate {
        plan: PathBuf,
        /// Overall time limit for the sandbox run.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Synthesize a recipe, generate its plan and validate it.
    Build {
        ecosystem: String,
        package: String,
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        install_deps: bool,
        /// Generate the plan only.
        #[arg(long)]
        no_sandbox: bool,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    match cli.command {
        Command::Plan {
            recipe,
            target,
            install_deps,
            output,
        } => cmd_plan(&cfg, &recipe, &target, install_deps, output.as_deref()),
        Command::Validate { plan, timeout_secs } => cmd_validate(&cfg, &plan, timeout_secs),
        Command::Build {
            ecosystem,
            package,
            target,
            install_deps,
            no_sandbox,
        } => cmd_build(&cfg, ecosystem, package, &target, install_deps, no_sandbox),
    }
}

/// Host-side collaborators shared by `plan` and `build`.
struct Host {
    tools: ToolsDir,
    loader: DirRecipeLoader,
    hint: String,
}

impl Host {
    fn from_config(cfg: &PlannerConfig) -> Self {
        Self {
            tools: ToolsDir::new(&cfg.tools_dir),
            loader: DirRecipeLoader::new(&cfg.recipes_dir),
            hint: cfg.installer.hint(),
        }
    }

    fn load_recipe(&self, recipe: &str) -> Result<Recipe> {
        let path = Path::new(recipe);
        if path.extension().is_some_and(|ext| ext == "toml") {
            return load_recipe_file(path);
        }
        self.loader
            .load(recipe)
            .with_context(|| format!("load recipe '{recipe}'"))
    }
}

fn executor(cfg: &PlannerConfig) -> SandboxExecutor<ProbeDetector> {
    let detector = ProbeDetector::new(
        cfg.sandbox.runtimes.clone(),
        cfg.sandbox.probe_timeout(),
        cfg.sandbox.output_limit_bytes,
    );
    SandboxExecutor::new(detector, SandboxSettings::from_config(&cfg.sandbox))
}

fn cmd_plan(
    cfg: &PlannerConfig,
    recipe: &str,
    target: &TargetArgs,
    install_deps: bool,
    output: Option<&Path>,
) -> Result<i32> {
    let host = Host::from_config(cfg);
    let recipe = host.load_recipe(recipe)?;
    let installer = HostInstaller::new(
        &host.tools,
        StdioConsent,
        CommandToolInstall::from_config(&cfg.installer),
    );
    let options = PlanOptions::new(&host.tools)
        .with_installer(&installer)
        .with_loader(&host.loader)
        .with_install_hint(&host.hint)
        .auto_accept(cfg.auto_accept_eval_deps || install_deps);

    let plan = match generate_plan(&recipe, &target.platform(), &options) {
        Ok(plan) => plan,
        Err(err) if err.is_declined() => {
            eprintln!("{err}");
            return Ok(exit_codes::DECLINED);
        }
        Err(err) => return Err(err.into()),
    };
    if !plan.is_complete() {
        eprintln!(
            "warning: plan is incomplete, missing: {}",
            plan.missing.join(", ")
        );
    }
    emit_plan(&plan, output)?;
    Ok(exit_codes::OK)
}

fn cmd_validate(cfg: &PlannerConfig, path: &Path, timeout_secs: Option<u64>) -> Result<i32> {
    let plan = load_plan(path)?;
    if !cfg.sandbox.enabled {
        eprintln!("sandbox: skipped: disabled in config");
        return Ok(exit_codes::OK);
    }
    let control = timeout_secs
        .map(|secs| RunControl::with_timeout(Duration::from_secs(secs)))
        .unwrap_or_else(RunControl::unbounded);
    let outcome = executor(cfg).validate(&plan, &control);
    Ok(report_outcome(&outcome))
}

fn cmd_build(
    cfg: &PlannerConfig,
    ecosystem: String,
    package: String,
    target: &TargetArgs,
    install_deps: bool,
    no_sandbox: bool,
) -> Result<i32> {
    let host = Host::from_config(cfg);
    let installer = HostInstaller::new(
        &host.tools,
        StdioConsent,
        CommandToolInstall::from_config(&cfg.installer),
    );
    let options = PlanOptions::new(&host.tools)
        .with_installer(&installer)
        .with_loader(&host.loader)
        .with_install_hint(&host.hint)
        .auto_accept(cfg.auto_accept_eval_deps || install_deps);

    let sandbox = executor(cfg);
    let mut orchestrator = Orchestrator::new(RegistryBuilder::new(&host.loader), options);
    if cfg.sandbox.enabled {
        orchestrator = orchestrator.with_sandbox(&sandbox);
    }
    let mut request = BuildRequest::new(ecosystem, package, target.platform());
    if no_sandbox {
        request = request.plan_only();
    }

    let report = orchestrator.build(&request, &RunControl::unbounded());
    if let Some(err) = report.error {
        if err.is_declined() {
            eprintln!("{err}");
            return Ok(exit_codes::DECLINED);
        }
        return Err(err.into());
    }
    if let Some(plan) = &report.plan {
        emit_plan(plan, None)?;
    }
    match &report.sandbox {
        Some(outcome) => Ok(report_outcome(outcome)),
        None => {
            eprintln!("sandbox: not run");
            Ok(exit_codes::OK)
        }
    }
}

fn emit_plan(plan: &Plan, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => write_plan(path, plan),
        None => {
            let json = serde_json::to_string_pretty(plan).context("serialize plan")?;
            println!("{json}");
            Ok(())
        }
    }
}

fn report_outcome(outcome: &SandboxOutcome) -> i32 {
    eprintln!("sandbox: {outcome}");
    match outcome {
        SandboxOutcome::Succeeded | SandboxOutcome::Skipped { .. } => exit_codes::OK,
        SandboxOutcome::Failed(failure) => {
            if let SandboxFailure::StepFailed { output, .. } = failure {
                eprintln!("{}", output.trim_end());
            }
            exit_codes::SANDBOX_FAILED
        }
    }
}

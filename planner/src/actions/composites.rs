//! Built-in composite actions and their decomposition rules.

use anyhow::{Result, bail};
use serde_json::Value;

use super::{Action, ActionDeps, Composite, EvalContext, require_str, str_list};
use crate::recipe::{Params, Step};

/// Copy optional parameters through to a decomposed step.
fn carry(mut step: Step, params: &Params, keys: &[&str]) -> Step {
    for key in keys {
        if let Some(value) = params.get(*key) {
            step.params.insert((*key).to_string(), value.clone());
        }
    }
    step
}

/// `download_archive`: fetch an archive, unpack it, install its binaries.
#[derive(Debug, Clone, Copy)]
pub struct DownloadArchive;

impl Action for DownloadArchive {
    fn name(&self) -> &'static str {
        "download_archive"
    }

    fn deterministic(&self) -> bool {
        true
    }

    fn as_composite(&self) -> Option<&dyn Composite> {
        Some(self)
    }
}

impl Composite for DownloadArchive {
    fn decompose(&self, _ctx: &EvalContext<'_>, params: &Params) -> Result<Vec<Step>> {
        let url = require_str(self.name(), params, "url")?;
        let file = archive_file_name(url)?;
        let format = match params.get("archive_format").and_then(Value::as_str) {
            Some(format) => format.to_string(),
            None => infer_archive_format(file)?.to_string(),
        };
        let binaries = match str_list(params, "binaries") {
            Some(list) if !list.is_empty() => list,
            _ => bail!("download_archive requires a non-empty 'binaries' list"),
        };

        let download = carry(
            Step::new("download_file").param("url", url).param("dest", file),
            params,
            &["checksum"],
        );
        let extract = carry(
            Step::new("extract")
                .param("archive", file)
                .param("format", format),
            params,
            &["strip_dirs"],
        );
        Ok(vec![
            download,
            extract,
            Step::new("chmod").param("files", binaries.clone()),
            Step::new("install_binaries").param("binaries", binaries),
        ])
    }
}

/// `github_archive`: resolve a release asset URL, then `download_archive` it.
#[derive(Debug, Clone, Copy)]
pub struct GithubArchive;

impl Action for GithubArchive {
    fn name(&self) -> &'static str {
        "github_archive"
    }

    fn requires_network(&self) -> bool {
        true
    }

    fn as_composite(&self) -> Option<&dyn Composite> {
        Some(self)
    }
}

impl Composite for GithubArchive {
    fn decompose(&self, ctx: &EvalContext<'_>, params: &Params) -> Result<Vec<Step>> {
        let repo = require_str(self.name(), params, "repo")?;
        if repo.split('/').filter(|part| !part.is_empty()).count() != 2 {
            bail!("github_archive 'repo' must be owner/name, got '{repo}'");
        }
        let pattern = require_str(self.name(), params, "asset_pattern")?;
        let version = ctx.version(params);
        if version == "latest" {
            bail!("github_archive for {repo} requires a pinned version");
        }
        let prefix = params
            .get("tag_prefix")
            .and_then(Value::as_str)
            .unwrap_or("v");
        let asset = pattern
            .replace("{version}", &version)
            .replace("{os}", &ctx.platform.os)
            .replace("{arch}", &ctx.platform.arch);
        let url = format!("https://github.com/{repo}/releases/download/{prefix}{version}/{asset}");

        let step = carry(
            Step::new("download_archive").param("url", url),
            params,
            &["binaries", "archive_format", "checksum", "strip_dirs"],
        );
        Ok(vec![step])
    }
}

/// Ecosystem installer composite (`pipx_install`, `npm_install`, ...).
///
/// Needs its toolchain on the host to decompose, and again inside the sandbox
/// to run the resulting primitive. The host toolchain version is frozen into
/// the primitive's parameters.
#[derive(Debug, Clone, Copy)]
pub struct EcosystemInstall {
    name: &'static str,
    primitive: &'static str,
    toolchain: &'static [&'static str],
    /// Parameter naming the package (`package`, `crate`, `module`, `gem`).
    package_key: &'static str,
    /// Parameter recording the host toolchain version on the primitive.
    toolchain_param: &'static str,
}

pub(super) const ECOSYSTEM: &[EcosystemInstall] = &[
    EcosystemInstall {
        name: "pipx_install",
        primitive: "pip_exec",
        toolchain: &["python-standalone"],
        package_key: "package",
        toolchain_param: "python_version",
    },
    EcosystemInstall {
        name: "npm_install",
        primitive: "npm_exec",
        toolchain: &["nodejs"],
        package_key: "package",
        toolchain_param: "node_version",
    },
    EcosystemInstall {
        name: "cargo_install",
        primitive: "cargo_build",
        toolchain: &["rust"],
        package_key: "crate",
        toolchain_param: "rust_version",
    },
    EcosystemInstall {
        name: "go_install",
        primitive: "go_build",
        toolchain: &["go"],
        package_key: "module",
        toolchain_param: "go_version",
    },
    EcosystemInstall {
        name: "gem_install",
        primitive: "gem_exec",
        toolchain: &["ruby"],
        package_key: "gem",
        toolchain_param: "ruby_version",
    },
];

impl EcosystemInstall {
    fn package<'a>(&self, params: &'a Params) -> Result<&'a str> {
        let value = params
            .get(self.package_key)
            .or_else(|| params.get("package"))
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty());
        match value {
            Some(value) => Ok(value),
            None => bail!("{} requires a '{}' parameter", self.name, self.package_key),
        }
    }
}

impl Action for EcosystemInstall {
    fn name(&self) -> &'static str {
        self.name
    }

    fn deps(&self) -> ActionDeps {
        ActionDeps {
            eval_time: self.toolchain,
            install_time: self.toolchain,
            ..ActionDeps::EMPTY
        }
    }

    fn requires_network(&self) -> bool {
        true
    }

    fn as_composite(&self) -> Option<&dyn Composite> {
        Some(self)
    }
}

impl Composite for EcosystemInstall {
    fn decompose(&self, ctx: &EvalContext<'_>, params: &Params) -> Result<Vec<Step>> {
        let package = self.package(params)?;
        let executables = match str_list(params, "executables") {
            Some(list) if !list.is_empty() => list,
            _ => vec![package.rsplit('/').next().unwrap_or(package).to_string()],
        };

        let mut step = Step::new(self.primitive)
            .param(self.package_key, package)
            .param("version", ctx.version(params))
            .param("executables", executables);
        for tool in self.toolchain {
            if let Some(version) = ctx.toolchain_version(tool) {
                step = step.param(self.toolchain_param, version);
            }
        }
        Ok(vec![step])
    }
}

fn archive_file_name(url: &str) -> Result<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() && path.contains('/') => Ok(name),
        _ => bail!("cannot derive archive file name from '{url}'"),
    }
}

fn infer_archive_format(file: &str) -> Result<&'static str> {
    const SUFFIXES: &[(&str, &str)] = &[
        (".tar.gz", "tar.gz"),
        (".tgz", "tar.gz"),
        (".tar.xz", "tar.xz"),
        (".txz", "tar.xz"),
        (".tar.bz2", "tar.bz2"),
        (".tar.zst", "tar.zst"),
        (".tar", "tar"),
        (".zip", "zip"),
    ];
    SUFFIXES
        .iter()
        .find(|(suffix, _)| file.ends_with(suffix))
        .map(|(_, format)| *format)
        .ok_or_else(|| anyhow::anyhow!("cannot infer archive format of '{file}'"))
}

//! Built-in primitive actions.
//!
//! Primitives never decompose; the step runner executes them directly. They
//! differ only in their declared dependencies and execution traits, so a
//! single data-driven type covers the whole catalogue.

use super::{Action, ActionDeps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Primitive {
    name: &'static str,
    deps: ActionDeps,
    deterministic: bool,
    network: bool,
}

impl Primitive {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            deps: ActionDeps::EMPTY,
            deterministic: false,
            network: false,
        }
    }

    pub const fn with_deps(mut self, deps: ActionDeps) -> Self {
        self.deps = deps;
        self
    }

    pub const fn with_determinism(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub const fn with_network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }
}

impl Action for Primitive {
    fn name(&self) -> &'static str {
        self.name
    }

    fn deps(&self) -> ActionDeps {
        self.deps
    }

    fn deterministic(&self) -> bool {
        self.deterministic
    }

    fn requires_network(&self) -> bool {
        self.network
    }
}

const fn installs(tools: &'static [&'static str]) -> ActionDeps {
    ActionDeps {
        install_time: tools,
        ..ActionDeps::EMPTY
    }
}

const fn plain(name: &'static str) -> Primitive {
    Primitive::new(name).with_determinism(true)
}

/// Ecosystem primitives fetch packages at install time.
const fn ecosystem(name: &'static str, toolchain: &'static [&'static str]) -> Primitive {
    Primitive::new(name)
        .with_deps(installs(toolchain))
        .with_network(true)
}

pub(super) const BUILTIN: &[Primitive] = &[
    plain("download_file"),
    plain("extract"),
    plain("chmod"),
    plain("install_binaries"),
    plain("set_env"),
    Primitive::new("homebrew_relocate").with_deps(ActionDeps {
        linux_install_time: &["patchelf"],
        ..ActionDeps::EMPTY
    }),
    Primitive::new("run_command"),
    ecosystem("pip_exec", &["python-standalone"]),
    ecosystem("npm_exec", &["nodejs"]),
    ecosystem("cargo_build", &["rust"]),
    ecosystem("go_build", &["go"]),
    ecosystem("gem_exec", &["ruby"]),
    Primitive::new("configure_make").with_deps(installs(&["make", "zig", "pkg-config"])),
    Primitive::new("cmake_build"),
];

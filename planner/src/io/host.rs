//! Queryable host tool state.
//!
//! Plan generation only needs to know whether a tool is present on the host
//! and which version, so the query is a trait with an in-memory fake for
//! tests and a directory-backed implementation for the CLI.

use std::cmp::Ordering;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::warn;

pub trait HostTools: Send + Sync {
    fn is_installed(&self, tool: &str) -> bool {
        self.installed_version(tool).is_some()
    }

    /// Highest installed version of `tool`, if any.
    fn installed_version(&self, tool: &str) -> Option<String>;
}

impl<T: HostTools + ?Sized> HostTools for &T {
    fn is_installed(&self, tool: &str) -> bool {
        (**self).is_installed(tool)
    }

    fn installed_version(&self, tool: &str) -> Option<String> {
        (**self).installed_version(tool)
    }
}

/// Host tools laid out as `<root>/<name>-<version>/` directories.
#[derive(Debug, Clone)]
pub struct ToolsDir {
    root: PathBuf,
}

impl ToolsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn versions(&self, tool: &str) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(root = %self.root.display(), err = %err, "failed to read tools dir");
                return Vec::new();
            }
        };
        let prefix = format!("{tool}-");
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| {
                let version = name.strip_prefix(&prefix)?;
                version
                    .starts_with(|c: char| c.is_ascii_digit())
                    .then(|| version.to_string())
            })
            .collect()
    }
}

impl HostTools for ToolsDir {
    fn installed_version(&self, tool: &str) -> Option<String> {
        self.versions(tool)
            .into_iter()
            .max_by(|a, b| compare_versions(a, b))
    }
}

/// Compare dotted versions numerically where possible (`3.9` < `3.12`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split(['.', '-', '+']);
    let mut right = b.split(['.', '-', '+']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

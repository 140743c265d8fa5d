//! `bazel info` parsing and source path mapping.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Parsed output of `bazel info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BazelInfo {
    entries: BTreeMap<String, String>,
}

impl BazelInfo {
    /// Parse `key: value` lines.
    ///
    /// Lines are split on the first `:` so Windows paths and URLs keep their
    /// colons. Lines without a colon are ignored.
    pub fn parse(output: &str) -> Self {
        let entries = output
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.get("workspace").map(Path::new)
    }

    pub fn output_base(&self) -> Option<&Path> {
        self.get("output_base").map(Path::new)
    }

    pub fn execution_root(&self) -> Option<&Path> {
        self.get("execution_root").map(Path::new)
    }

    /// Name of the main repository, i.e. the last component of `execution_root`.
    pub fn workspace_name(&self) -> Option<&str> {
        self.execution_root()?.file_name()?.to_str()
    }

    /// Where `source` appears when loaded as `@<workspace name>//...`.
    ///
    /// `<output_base>/external/<workspace name>/<source relative to workspace>`.
    /// `None` when the info is incomplete or `source` lies outside the
    /// workspace.
    pub fn external_path(&self, source: &Path) -> Option<PathBuf> {
        let relative = source.strip_prefix(self.workspace()?).ok()?;
        Some(
            self.output_base()?
                .join("external")
                .join(self.workspace_name()?)
                .join(relative),
        )
    }
}

/// Resolve `path` to its canonical on-disk location.
///
/// Frames reported from Bazel's output tree often point at symlinks back into
/// the workspace. Falls back to `path` unchanged when it cannot be resolved.
pub fn resolve_real_path(path: &str) -> String {
    match std::fs::canonicalize(path) {
        Ok(real) => real.to_string_lossy().into_owned(),
        Err(_) => path.to_string(),
    }
}

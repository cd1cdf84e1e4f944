//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default name of rule files searched in the input tree.
pub const DEFAULT_RULES_FILENAME: &str = "rules.json";

/// The three configured root directories.
///
/// Unset roots are empty paths; placeholders referring to them expand to
/// nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roots {
    pub input: PathBuf,
    pub build: PathBuf,
    pub output: PathBuf,
}

/// Which root directory a path setting refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Input,
    Build,
    Output,
}

impl std::fmt::Display for RootKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootKind::Input => f.write_str("input"),
            RootKind::Build => f.write_str("build"),
            RootKind::Output => f.write_str("output"),
        }
    }
}

impl Roots {
    pub fn get(&self, kind: RootKind) -> &Path {
        match kind {
            RootKind::Input => &self.input,
            RootKind::Build => &self.build,
            RootKind::Output => &self.output,
        }
    }

    pub(crate) fn set(&mut self, kind: RootKind, path: PathBuf) {
        match kind {
            RootKind::Input => self.input = path,
            RootKind::Build => self.build = path,
            RootKind::Output => self.output = path,
        }
    }
}

/// Tunables that do not depend on the file system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// File name of rule files in the input tree.
    pub rules_filename: String,
    /// 0 = pass summaries only, 1 = one line per job, 2 = one line per match.
    pub verbose: u32,
    /// Worker threads for parallel jobs. `None` uses the global pool.
    pub threads: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rules_filename: DEFAULT_RULES_FILENAME.to_string(),
            verbose: 0,
            threads: None,
        }
    }
}

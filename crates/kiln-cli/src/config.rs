//! Configuration file support.

use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default CLI options.
    pub defaults: Defaults,
    /// Default root directories.
    pub paths: Paths,
}

/// Default CLI options.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Verbosity level (same as passing `-v` that many times).
    pub verbose: u8,
    /// Worker threads for parallel jobs.
    pub threads: Option<usize>,
    /// File name of rule files.
    pub rules: Option<String>,
    /// Cache file.
    pub cache: Option<PathBuf>,
}

/// Default root directories.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub input: Option<PathBuf>,
    pub build: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl Config {
    /// Load config from the default location (~/.config/kiln/config.toml).
    pub fn load() -> Self {
        Self::load_from_path(Self::default_path())
    }

    /// Load config from a specific path.
    ///
    /// A missing file yields the defaults; an unreadable one is reported and
    /// also yields the defaults.
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("kiln").join("config.toml"))
    }
}

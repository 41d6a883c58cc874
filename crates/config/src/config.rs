//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading the config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    /// JSON parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Two library entries share the same name
    #[error("Duplicate library name: {0}")]
    DuplicateLibraryName(String),
}

/// A watched library root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Absolute path of the library root directory.
    pub library: PathBuf,
    /// Display name, unique across libraries.
    pub name: String,
}

/// One configured pipeline stage.
///
/// `job_action` is either a bare action name or a qualified
/// `plugin-id.name` identifier. Any further fields are action-specific and
/// passed through to the action constructor untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobActionConfig {
    /// Action identifier to resolve against the plugin registry.
    #[serde(rename = "jobAction")]
    pub job_action: String,
    /// Display name for logs and diagnostics.
    pub name: String,
    /// Action-specific settings, handed to the constructor as-is.
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// Main configuration structure, read from `<storage>/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Watched library roots.
    #[serde(default)]
    pub libraries: Vec<LibraryConfig>,
    /// Ordered action pipeline applied to every job.
    #[serde(default)]
    pub job_actions: Vec<JobActionConfig>,
    /// Optional allow-list of plugin identifiers; when present, only these
    /// discovered plugins are loaded.
    #[serde(default)]
    pub plugins: Option<Vec<String>>,
    /// Plugins loaded but never activated.
    #[serde(default)]
    pub disabled_plugins: Vec<String>,
    /// Libraries constructed but never watched.
    #[serde(default)]
    pub disabled_libraries: Vec<String>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_json(&content)
    }

    /// Load configuration, tolerating a missing file.
    ///
    /// Returns `Ok(None)` when the file does not exist (the daemon runs with
    /// an empty configuration); any other IO or parse failure is an error.
    pub fn load_if_exists<P: AsRef<Path>>(path: P) -> Result<Option<Self>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(Self::parse_json(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Parse configuration from a JSON string and validate it
    pub fn parse_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-entry constraints.
    ///
    /// Library names must be unique; everything else is checked at the point
    /// of use (unresolvable actions are skipped per-entry, not fatal).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for lib in &self.libraries {
            if !names.insert(lib.name.as_str()) {
                return Err(ConfigError::DuplicateLibraryName(lib.name.clone()));
            }
        }
        Ok(())
    }

    /// Whether a plugin identifier passes the allow-list filter.
    pub fn plugin_allowed(&self, id: &str) -> bool {
        match &self.plugins {
            Some(allowed) => allowed.iter().any(|p| p == id),
            None => true,
        }
    }

    /// Whether a plugin identifier is on the deny-list.
    pub fn plugin_disabled(&self, id: &str) -> bool {
        self.disabled_plugins.iter().any(|p| p == id)
    }

    /// Whether a library name is on the deny-list.
    pub fn library_disabled(&self, name: &str) -> bool {
        self.disabled_libraries.iter().any(|l| l == name)
    }
}

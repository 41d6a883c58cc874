//! Plugin package manifests
//!
//! Plugins are packaged directories carrying a `package.json`. This module
//! parses plugin identifiers, reads manifests, and validates candidates
//! against the host compatibility contract.

use semver::VersionReq;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Keyword a manifest must carry to be considered a plugin.
pub const PLUGIN_KEYWORD: &str = "compressarr-plugin";

/// The host's name as it appears in engines / dependency tables.
pub const HOST_NAME: &str = "compressarr";

/// Manifest file name inside a plugin directory.
pub const MANIFEST_FILE: &str = "package.json";

/// Engines key for the runtime compatibility range.
const RUNTIME_ENGINE: &str = "runtime";

/// Error type for manifest reading and validation
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The directory has no manifest file.
    #[error("No {MANIFEST_FILE} in candidate directory")]
    Missing,

    /// IO error reading the manifest.
    #[error("Failed to read manifest: {0}")]
    Io(#[from] io::Error),

    /// JSON parsing error.
    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),

    /// Name does not match `((@scope)/)?compressarr-<slug>`.
    #[error("Name {0:?} does not match the plugin identifier pattern")]
    InvalidName(String),

    /// Keywords do not include the plugin sentinel.
    #[error("Keywords do not include {PLUGIN_KEYWORD:?}")]
    MissingKeyword,

    /// The version field is empty or absent.
    #[error("Manifest has no version")]
    EmptyVersion,

    /// No host range under engines and no host peer dependency to promote.
    #[error("Manifest declares no {HOST_NAME} version range (engines or peerDependencies)")]
    MissingHostRange,

    /// The declared host range is not a valid semver requirement.
    #[error("Invalid {HOST_NAME} version range {0:?}: {1}")]
    InvalidHostRange(String, semver::Error),

    /// The declared runtime range is not a valid semver requirement.
    #[error("Invalid runtime version range {0:?}: {1}")]
    InvalidRuntimeRange(String, semver::Error),
}

/// Identifier of a plugin: `((@scope)/)?compressarr-<slug>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PluginIdentifier {
    scope: Option<String>,
    slug: String,
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | '_' | '~')
        })
}

impl PluginIdentifier {
    /// Parse an identifier, returning `None` when the pattern does not match.
    pub fn parse(name: &str) -> Option<Self> {
        let (scope, bare) = match name.strip_prefix('@') {
            Some(rest) => {
                let (scope, bare) = rest.split_once('/')?;
                if !valid_segment(scope) {
                    return None;
                }
                (Some(scope.to_string()), bare)
            }
            None => (None, name),
        };

        let slug = bare.strip_prefix("compressarr-")?;
        if !valid_segment(slug) {
            return None;
        }

        Some(Self {
            scope,
            slug: slug.to_string(),
        })
    }

    /// The scope, without the leading `@`.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }
}

impl fmt::Display for PluginIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "@{}/compressarr-{}", scope, self.slug),
            None => write!(f, "compressarr-{}", self.slug),
        }
    }
}

/// Raw `package.json` as found on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub engines: HashMap<String, String>,
    #[serde(default, rename = "peerDependencies")]
    pub peer_dependencies: HashMap<String, String>,
    #[serde(default)]
    pub dependencies: HashMap<String, String>,
    #[serde(default = "default_main")]
    pub main: String,
}

fn default_main() -> String {
    "index.js".to_string()
}

/// A manifest that passed validation.
///
/// The raw engines and dependency tables are load context; only what the
/// registry needs afterwards is kept here.
#[derive(Debug, Clone)]
pub struct PluginManifest {
    pub identifier: PluginIdentifier,
    pub version: String,
    pub host_range: VersionReq,
    pub runtime_range: Option<VersionReq>,
    pub main: String,
    /// The plugin lists the host in its regular dependencies — the
    /// bundled-host anti-pattern the registry warns about.
    pub bundles_host: bool,
}

/// Read `package.json` from a candidate directory.
pub fn read_manifest(dir: &Path) -> Result<PackageManifest, ManifestError> {
    let path = dir.join(MANIFEST_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ManifestError::Missing),
        Err(e) => return Err(ManifestError::Io(e)),
    };
    Ok(serde_json::from_str(&content)?)
}

/// Validate a raw manifest against the host contract.
///
/// Checks, in order: identifier pattern, plugin keyword, non-empty version,
/// and a host version range — `engines.compressarr`, with a
/// `peerDependencies.compressarr` entry promoted when engines has none.
pub fn validate_manifest(raw: PackageManifest) -> Result<PluginManifest, ManifestError> {
    let identifier = PluginIdentifier::parse(&raw.name)
        .ok_or_else(|| ManifestError::InvalidName(raw.name.clone()))?;

    if !raw.keywords.iter().any(|k| k == PLUGIN_KEYWORD) {
        return Err(ManifestError::MissingKeyword);
    }

    if raw.version.is_empty() {
        return Err(ManifestError::EmptyVersion);
    }

    let host_range_src = raw
        .engines
        .get(HOST_NAME)
        .or_else(|| raw.peer_dependencies.get(HOST_NAME))
        .ok_or(ManifestError::MissingHostRange)?;
    let host_range = VersionReq::parse(host_range_src)
        .map_err(|e| ManifestError::InvalidHostRange(host_range_src.clone(), e))?;

    let runtime_range = match raw.engines.get(RUNTIME_ENGINE) {
        Some(src) => Some(
            VersionReq::parse(src)
                .map_err(|e| ManifestError::InvalidRuntimeRange(src.clone(), e))?,
        ),
        None => None,
    };

    let bundles_host = raw.dependencies.contains_key(HOST_NAME);

    Ok(PluginManifest {
        identifier,
        version: raw.version,
        host_range,
        runtime_range,
        main: raw.main,
        bundles_host,
    })
}

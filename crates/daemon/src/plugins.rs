//! Plugin registry
//!
//! Discovers packaged action plugins on disk, validates them against the
//! host compatibility contract, loads their entry modules, and runs their
//! initializers. Registry tables are populated during startup and read-only
//! afterwards; action registrations arrive over the bus while initializers
//! run.

use crate::actions::{ActionFactory, ActionIdentifier, ActionRegistration, ResolutionError};
use crate::bus::{Event, EventBus, EventKind};
use crate::host::{HostApi, PluginHandle, HOST_API_VERSION};
use crate::manifest::{self, ManifestError, PluginIdentifier, PluginManifest, MANIFEST_FILE};
use compressarr_config::Config;
use semver::Version;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Error type for plugin loading and initialization.
///
/// Always per-plugin: the failing plugin is dropped from the registry and
/// the rest proceed.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The entry module exposes neither a direct nor a `default`
    /// initializer.
    #[error("Entry module has no initializer (direct or default export)")]
    NoInitializer,

    /// The entry module could not be resolved or executed.
    #[error("Failed to load entry module: {0}")]
    Load(String),

    /// The initializer ran and failed.
    #[error("Initialization failed: {0}")]
    Initialize(String),
}

/// A plugin's initialization entry point.
pub trait PluginInitializer: Send + Sync {
    /// Called once at startup with a handle bound to the owning plugin.
    fn initialize(&self, host: PluginHandle) -> Result<(), PluginError>;
}

/// What loading a plugin's entry module produced.
///
/// Mirrors the two accepted entry shapes: the module itself is callable, or
/// it exposes a callable `default`.
#[derive(Clone, Default)]
pub struct LoadedModule {
    pub initializer: Option<Arc<dyn PluginInitializer>>,
    pub default: Option<Arc<dyn PluginInitializer>>,
}

/// Collaborator that resolves and executes a plugin's entry module.
///
/// The registry owns the either-export-or-fatal rule; loaders just report
/// what the module exposes.
pub trait PluginLoader: Send + Sync {
    fn load(&self, plugin: &PluginIdentifier, entry: &Path) -> Result<LoadedModule, PluginError>;
}

/// Loader over initializers linked into the host process.
///
/// Embedders register a module per plugin identifier; a discovered package
/// with no linked module fails to load (and is dropped like any other load
/// failure).
#[derive(Default)]
pub struct StaticPluginLoader {
    modules: HashMap<String, LoadedModule>,
}

impl StaticPluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the module for a plugin identifier.
    pub fn register(&mut self, plugin: impl Into<String>, module: LoadedModule) {
        self.modules.insert(plugin.into(), module);
    }
}

impl PluginLoader for StaticPluginLoader {
    fn load(&self, plugin: &PluginIdentifier, _entry: &Path) -> Result<LoadedModule, PluginError> {
        self.modules
            .get(&plugin.to_string())
            .cloned()
            .ok_or_else(|| PluginError::Load(format!("no linked module for {}", plugin)))
    }
}

/// A discovered, validated plugin. Owned by the registry for the process
/// lifetime; never unloaded.
pub struct Plugin {
    pub manifest: PluginManifest,
    /// On-disk package directory.
    pub path: PathBuf,
    /// Loaded, but its actions are never activated.
    pub disabled: bool,
    /// Action name → constructor, filled during initialization.
    pub actions: HashMap<String, ActionFactory>,
    initializer: Option<Arc<dyn PluginInitializer>>,
}

impl Plugin {
    pub fn identifier(&self) -> &PluginIdentifier {
        &self.manifest.identifier
    }
}

/// The version of the host's action runtime contract, checked against
/// `engines.runtime` ranges.
pub fn runtime_version() -> Version {
    Version::new(HOST_API_VERSION as u64, 0, 0)
}

/// Compute the plugin search paths: the host's own module path, the
/// OS-standard global install locations, every `NODE_PATH` entry, and an
/// optional user-supplied extra path.
pub fn search_paths(extra: Option<&Path>) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();

    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            paths.push(dir.join("node_modules"));
        }
    }

    if cfg!(windows) {
        if let Some(appdata) = env::var_os("APPDATA") {
            paths.push(PathBuf::from(appdata).join("npm").join("node_modules"));
        }
    } else {
        paths.push(PathBuf::from("/usr/local/lib/node_modules"));
        paths.push(PathBuf::from("/usr/lib/node_modules"));
        if let Some(prefix) = package_manager_prefix() {
            paths.push(prefix.join("lib").join("node_modules"));
        }
    }

    if let Some(node_path) = env::var_os("NODE_PATH") {
        paths.extend(env::split_paths(&node_path));
    }

    if let Some(extra) = extra {
        paths.push(extra.to_path_buf());
    }

    paths.dedup();
    paths
}

/// The package manager's global prefix (`npm prefix -g`), best-effort.
fn package_manager_prefix() -> Option<PathBuf> {
    let output = Command::new("npm").args(["prefix", "-g"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let prefix = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if prefix.is_empty() {
        None
    } else {
        Some(PathBuf::from(prefix))
    }
}

/// An action constructor resolved for one config entry.
#[derive(Clone)]
pub struct ResolvedAction {
    pub plugin: PluginIdentifier,
    pub name: String,
    pub factory: ActionFactory,
}

impl std::fmt::Debug for ResolvedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAction")
            .field("plugin", &self.plugin)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Tables {
    plugins: HashMap<PluginIdentifier, Plugin>,
    /// Discovery order; initialization follows it.
    order: Vec<PluginIdentifier>,
    /// Action name → contributing plugins, for bare-name resolution.
    name_index: HashMap<String, Vec<PluginIdentifier>>,
    /// Mis-declared plugin id → actual identifier.
    translations: HashMap<String, PluginIdentifier>,
}

/// Discovers, validates, loads, and initializes plugins.
pub struct PluginRegistry {
    host: Arc<HostApi>,
    runtime_version: Version,
    tables: Mutex<Tables>,
}

impl PluginRegistry {
    pub fn new(host: Arc<HostApi>) -> Arc<Self> {
        Arc::new(Self {
            host,
            runtime_version: runtime_version(),
            tables: Mutex::new(Tables::default()),
        })
    }

    /// Subscribe the registration handler on the bus.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let registry = self.clone();
        bus.subscribe(EventKind::RegisterAction, move |event| {
            if let Event::RegisterAction(registration) = event {
                registry.on_register_action(registration);
            }
        });
    }

    /// Scan the search paths for plugin packages.
    ///
    /// A search path that is itself a package counts as a single candidate;
    /// otherwise its immediate children do, with `@scope` directories
    /// expanded one level. Invalid candidates are logged and skipped.
    pub fn discover(&self, config: &Config, search_paths: &[PathBuf]) {
        for path in search_paths {
            if path.join(MANIFEST_FILE).is_file() {
                self.consider(config, path);
                continue;
            }

            let Ok(entries) = fs::read_dir(path) else {
                continue;
            };
            for entry in entries.flatten() {
                let child = entry.path();
                if !child.is_dir() {
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('@') {
                    let Ok(scoped) = fs::read_dir(&child) else {
                        continue;
                    };
                    for scoped_entry in scoped.flatten() {
                        let scoped_child = scoped_entry.path();
                        if scoped_child.is_dir() {
                            self.consider(config, &scoped_child);
                        }
                    }
                } else {
                    self.consider(config, &child);
                }
            }
        }
    }

    fn consider(&self, config: &Config, dir: &Path) {
        let manifest = match manifest::read_manifest(dir).and_then(manifest::validate_manifest) {
            Ok(manifest) => manifest,
            Err(ManifestError::Missing) => {
                debug!(path = %dir.display(), "no manifest, not a plugin candidate");
                return;
            }
            Err(error) => {
                warn!(path = %dir.display(), %error, "skipping invalid plugin candidate");
                return;
            }
        };

        let identifier = manifest.identifier.clone();
        let id_string = identifier.to_string();

        if !config.plugin_allowed(&id_string) {
            debug!(plugin = %identifier, "not on the active-plugins list, skipping");
            return;
        }
        let disabled = config.plugin_disabled(&id_string);

        let mut tables = self.tables.lock().expect("registry tables poisoned");
        if tables.plugins.contains_key(&identifier) {
            warn!(
                plugin = %identifier,
                path = %dir.display(),
                "duplicate plugin identifier, keeping first discovery"
            );
            return;
        }

        info!(plugin = %identifier, version = %manifest.version, path = %dir.display(), "discovered plugin");
        tables.order.push(identifier.clone());
        tables.plugins.insert(
            identifier,
            Plugin {
                manifest,
                path: dir.to_path_buf(),
                disabled,
                actions: HashMap::new(),
                initializer: None,
            },
        );
    }

    /// Load every discovered plugin's entry module.
    ///
    /// Version mismatches warn and proceed; a module without an initializer
    /// is fatal for that plugin only.
    pub fn load(&self, loader: &dyn PluginLoader) {
        let order: Vec<PluginIdentifier> = {
            let tables = self.tables.lock().expect("registry tables poisoned");
            tables.order.clone()
        };

        for identifier in order {
            let (entry, manifest) = {
                let tables = self.tables.lock().expect("registry tables poisoned");
                let Some(plugin) = tables.plugins.get(&identifier) else {
                    continue;
                };
                (plugin.path.join(&plugin.manifest.main), plugin.manifest.clone())
            };

            if !manifest.host_range.matches(self.host.version()) {
                warn!(
                    plugin = %identifier,
                    required = %manifest.host_range,
                    host = %self.host.version(),
                    "plugin declares an incompatible host version range"
                );
            }
            if let Some(runtime_range) = &manifest.runtime_range {
                if !runtime_range.matches(&self.runtime_version) {
                    warn!(
                        plugin = %identifier,
                        required = %runtime_range,
                        runtime = %self.runtime_version,
                        "plugin declares an incompatible runtime version range"
                    );
                }
            }
            if manifest.bundles_host {
                warn!(
                    plugin = %identifier,
                    "plugin lists the host in its dependencies; it must use peerDependencies"
                );
            }

            match loader.load(&identifier, &entry) {
                Ok(module) => {
                    let initializer = module.initializer.or(module.default);
                    match initializer {
                        Some(initializer) => {
                            let mut tables =
                                self.tables.lock().expect("registry tables poisoned");
                            if let Some(plugin) = tables.plugins.get_mut(&identifier) {
                                plugin.initializer = Some(initializer);
                            }
                        }
                        None => {
                            error!(plugin = %identifier, "{}", PluginError::NoInitializer);
                            self.remove(&identifier);
                        }
                    }
                }
                Err(load_error) => {
                    error!(plugin = %identifier, %load_error, "failed to load plugin");
                    self.remove(&identifier);
                }
            }
        }
    }

    /// Run initializers in discovery order.
    ///
    /// Each initializer gets a handle bound to its plugin, so registrations
    /// carry their owner explicitly. Disabled plugins stay loaded but are
    /// never initialized.
    pub fn initialize(&self) {
        let order: Vec<PluginIdentifier> = {
            let tables = self.tables.lock().expect("registry tables poisoned");
            tables.order.clone()
        };

        for identifier in order {
            let initializer = {
                let mut tables = self.tables.lock().expect("registry tables poisoned");
                match tables.plugins.get_mut(&identifier) {
                    Some(plugin) if plugin.disabled => {
                        plugin.initializer = None;
                        continue;
                    }
                    Some(plugin) => plugin.initializer.take(),
                    None => continue,
                }
            };
            let Some(initializer) = initializer else {
                continue;
            };

            debug!(plugin = %identifier, "initializing plugin");
            let handle = PluginHandle::new(self.host.clone(), identifier.clone());
            if let Err(init_error) = initializer.initialize(handle) {
                error!(plugin = %identifier, %init_error, "plugin initialization failed");
                self.remove(&identifier);
            }
        }
    }

    /// Handler for registrations arriving on the bus during initialization.
    fn on_register_action(&self, registration: &ActionRegistration) {
        let mut tables = self.tables.lock().expect("registry tables poisoned");

        let Some(plugin) = tables.plugins.get_mut(&registration.owner) else {
            warn!(
                plugin = %registration.owner,
                action = %registration.name,
                "registration from unknown plugin, ignoring"
            );
            return;
        };
        plugin
            .actions
            .insert(registration.name.clone(), registration.factory.clone());

        let contributors = tables
            .name_index
            .entry(registration.name.clone())
            .or_default();
        if !contributors.contains(&registration.owner) {
            contributors.push(registration.owner.clone());
        }

        if let Some(declared) = &registration.declared_plugin {
            if *declared != registration.owner.to_string() {
                warn!(
                    declared = %declared,
                    actual = %registration.owner,
                    "registration declared a different plugin id, recording translation"
                );
                tables
                    .translations
                    .insert(declared.clone(), registration.owner.clone());
            }
        }

        debug!(plugin = %registration.owner, action = %registration.name, "action registered");
    }

    /// Drop a plugin and everything derived from it.
    fn remove(&self, identifier: &PluginIdentifier) {
        let mut tables = self.tables.lock().expect("registry tables poisoned");
        tables.plugins.remove(identifier);
        tables.order.retain(|id| id != identifier);
        for contributors in tables.name_index.values_mut() {
            contributors.retain(|id| id != identifier);
        }
        tables.name_index.retain(|_, v| !v.is_empty());
        tables.translations.retain(|_, id| id != identifier);
    }

    /// Resolve a config identifier to a constructor.
    ///
    /// Bare names must match exactly one enabled plugin; a collision lists
    /// the qualified alternatives. Qualified names require the plugin,
    /// falling back to the translation table for mis-declared ids.
    pub fn resolve(&self, identifier: &ActionIdentifier) -> Result<ResolvedAction, ResolutionError> {
        let tables = self.tables.lock().expect("registry tables poisoned");

        match identifier {
            ActionIdentifier::Bare(name) => {
                let enabled: Vec<&PluginIdentifier> = tables
                    .name_index
                    .get(name)
                    .map(|contributors| {
                        contributors
                            .iter()
                            .filter(|id| {
                                tables.plugins.get(id).map(|p| !p.disabled).unwrap_or(false)
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                match enabled.as_slice() {
                    [] => Err(ResolutionError::UnknownAction(name.clone())),
                    [only] => {
                        let plugin = (*only).clone();
                        let factory = tables
                            .plugins
                            .get(&plugin)
                            .and_then(|p| p.actions.get(name))
                            .cloned()
                            .ok_or_else(|| ResolutionError::UnknownAction(name.clone()))?;
                        Ok(ResolvedAction {
                            plugin,
                            name: name.clone(),
                            factory,
                        })
                    }
                    many => Err(ResolutionError::Ambiguous {
                        name: name.clone(),
                        candidates: many.iter().map(|id| format!("{}.{}", id, name)).collect(),
                    }),
                }
            }
            ActionIdentifier::Qualified { plugin, name } => {
                let resolved_id = PluginIdentifier::parse(plugin)
                    .filter(|id| tables.plugins.contains_key(id))
                    .or_else(|| tables.translations.get(plugin).cloned())
                    .ok_or_else(|| ResolutionError::UnknownPlugin(plugin.clone()))?;

                let entry = tables
                    .plugins
                    .get(&resolved_id)
                    .ok_or_else(|| ResolutionError::UnknownPlugin(plugin.clone()))?;
                if entry.disabled {
                    return Err(ResolutionError::PluginDisabled(resolved_id));
                }
                let factory = entry.actions.get(name).cloned().ok_or_else(|| {
                    ResolutionError::NotProvided {
                        plugin: resolved_id.clone(),
                        name: name.clone(),
                    }
                })?;
                Ok(ResolvedAction {
                    plugin: resolved_id,
                    name: name.clone(),
                    factory,
                })
            }
        }
    }

    pub fn plugin_count(&self) -> usize {
        self.tables
            .lock()
            .expect("registry tables poisoned")
            .plugins
            .len()
    }

    pub fn contains(&self, identifier: &PluginIdentifier) -> bool {
        self.tables
            .lock()
            .expect("registry tables poisoned")
            .plugins
            .contains_key(identifier)
    }
}

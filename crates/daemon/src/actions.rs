//! Action contract and instances
//!
//! Plugins contribute action constructors; the daemon instantiates them once
//! at startup, in configuration order, and drives jobs through the resulting
//! workers. The transcoding work itself lives behind the `Action` trait.

use crate::host::HostApi;
use crate::manifest::PluginIdentifier;
use crate::plugins::PluginRegistry;
use crate::runner::Job;
use async_trait::async_trait;
use compressarr_config::JobActionConfig;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Error type raised by action workers
#[derive(Debug, Error)]
pub enum ActionError {
    /// The worker was killed in response to job unregistration. Not a
    /// failure: the runner logs at debug level and stops silently.
    #[error("Action killed")]
    Killed,

    /// The worker could not be constructed from its configuration.
    #[error("Action setup failed: {0}")]
    Setup(String),

    /// The worker failed while processing a job.
    #[error("Action failed: {0}")]
    Execution(String),

    /// IO error inside the worker.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A unit of work contributed by a plugin; one stage in a job pipeline.
#[async_trait]
pub trait Action: Send + Sync {
    /// Process a job, returning it with `current_source` pointing at the
    /// produced artifact (or unchanged for pass-through actions).
    async fn start(&self, job: Job) -> Result<Job, ActionError>;

    /// Stop any in-flight work for the given job identifier.
    ///
    /// Must be idempotent, must release resources held for that identifier,
    /// and must cause an outstanding `start` for the same identifier to
    /// settle with [`ActionError::Killed`]. Calling this for an identifier
    /// the action is not handling is a no-op.
    async fn kill(&self, job_id: &Path) -> Result<(), ActionError>;
}

/// Everything a constructor gets to build a worker.
pub struct ActionContext {
    /// Display name from the action's config entry.
    pub name: String,
    /// Action-specific config block, passed through untouched.
    pub options: serde_json::Map<String, serde_json::Value>,
    /// Host API handle.
    pub host: Arc<HostApi>,
}

/// Constructor contributed by a plugin for one action name.
pub type ActionFactory =
    Arc<dyn Fn(ActionContext) -> Result<Box<dyn Action>, ActionError> + Send + Sync>;

/// A registration published on the bus while a plugin initializes.
///
/// `owner` is bound by the registration handle the initializer received, so
/// attribution never depends on ambient registry state. `declared_plugin` is
/// whatever the plugin said about itself; when it disagrees with `owner` the
/// registry records a translation so lookups under the mis-declared id still
/// resolve.
#[derive(Clone)]
pub struct ActionRegistration {
    pub owner: PluginIdentifier,
    pub declared_plugin: Option<String>,
    pub name: String,
    pub factory: ActionFactory,
}

impl fmt::Debug for ActionRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistration")
            .field("owner", &self.owner)
            .field("declared_plugin", &self.declared_plugin)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// How a config entry names an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionIdentifier {
    /// A bare name, resolved through the global name index.
    Bare(String),
    /// `plugin-id.name`, resolved against one specific plugin.
    Qualified { plugin: String, name: String },
}

impl ActionIdentifier {
    /// Parse a config identifier.
    ///
    /// The split is on the last dot, and only when the left side parses as a
    /// plugin identifier — slugs may themselves contain dots, action names
    /// may not.
    pub fn parse(raw: &str) -> Self {
        if let Some((plugin, name)) = raw.rsplit_once('.') {
            if !name.is_empty() && PluginIdentifier::parse(plugin).is_some() {
                return ActionIdentifier::Qualified {
                    plugin: plugin.to_string(),
                    name: name.to_string(),
                };
            }
        }
        ActionIdentifier::Bare(raw.to_string())
    }
}

impl fmt::Display for ActionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionIdentifier::Bare(name) => write!(f, "{}", name),
            ActionIdentifier::Qualified { plugin, name } => write!(f, "{}.{}", plugin, name),
        }
    }
}

/// Error type for action identifier resolution
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// No enabled plugin contributes the name.
    #[error("No plugin provides action {0:?}")]
    UnknownAction(String),

    /// More than one enabled plugin contributes the name; the reference must
    /// be qualified.
    #[error("Action {name:?} is ambiguous; qualify it as one of: {}", .candidates.join(", "))]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },

    /// The qualified plugin is not registered.
    #[error("No plugin registered as {0:?}")]
    UnknownPlugin(String),

    /// The qualified plugin is registered but disabled.
    #[error("Plugin {0} is disabled")]
    PluginDisabled(PluginIdentifier),

    /// The qualified plugin does not contribute that action.
    #[error("Plugin {plugin} has no action {name:?}")]
    NotProvided {
        plugin: PluginIdentifier,
        name: String,
    },
}

/// A worker built at startup from a resolved constructor.
///
/// Instances live for the process lifetime; one job at a time flows through
/// each (the runner serializes steps within a job).
pub struct ActionInstance {
    /// Display name from configuration.
    pub display_name: String,
    /// Plugin that contributed the constructor.
    pub plugin: PluginIdentifier,
    /// Action name within that plugin.
    pub action: String,
    worker: Box<dyn Action>,
}

impl ActionInstance {
    pub fn new(
        display_name: String,
        plugin: PluginIdentifier,
        action: String,
        worker: Box<dyn Action>,
    ) -> Self {
        Self {
            display_name,
            plugin,
            action,
            worker,
        }
    }

    pub async fn start(&self, job: Job) -> Result<Job, ActionError> {
        self.worker.start(job).await
    }

    pub async fn kill(&self, job_id: &Path) -> Result<(), ActionError> {
        self.worker.kill(job_id).await
    }
}

impl fmt::Debug for ActionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionInstance")
            .field("display_name", &self.display_name)
            .field("plugin", &self.plugin)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// Build the configured action pipeline.
///
/// Entries are constructed in configuration order. An entry that fails to
/// resolve (unknown, ambiguous, disabled plugin) or whose constructor fails
/// is logged and skipped; the rest of the pipeline loads normally.
pub fn build_action_instances(
    registry: &PluginRegistry,
    entries: &[JobActionConfig],
    host: &Arc<HostApi>,
) -> Vec<Arc<ActionInstance>> {
    let mut instances = Vec::new();

    for entry in entries {
        let identifier = ActionIdentifier::parse(&entry.job_action);
        let resolved = match registry.resolve(&identifier) {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(action = %identifier, name = %entry.name, %error, "skipping job action");
                continue;
            }
        };

        let context = ActionContext {
            name: entry.name.clone(),
            options: entry.options.clone(),
            host: host.clone(),
        };
        match (resolved.factory)(context) {
            Ok(worker) => {
                info!(
                    name = %entry.name,
                    plugin = %resolved.plugin,
                    action = %resolved.name,
                    "job action loaded"
                );
                instances.push(Arc::new(ActionInstance::new(
                    entry.name.clone(),
                    resolved.plugin,
                    resolved.name,
                    worker,
                )));
            }
            Err(error) => {
                warn!(name = %entry.name, %error, "action constructor failed, skipping");
            }
        }
    }

    instances
}

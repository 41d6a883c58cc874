//! Daemon startup and lifecycle
//!
//! Wires the bus, plugin registry, scheduler, runner, and library manager
//! together; boots them in dependency order; and coordinates shutdown.

use crate::actions::build_action_instances;
use crate::bus::{Event, EventBus, EventKind};
use crate::host::HostApi;
use crate::library::{LibraryError, LibraryManager};
use crate::paths::StoragePaths;
use crate::plugins::{self, PluginLoader, PluginRegistry};
use crate::probe::MediaProbe;
use crate::runner::JobRunner;
use crate::scheduler::JobScheduler;
use crate::watcher::DEFAULT_WRITE_SETTLE;
use compressarr_config::{Config, ConfigError};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Error type for daemon startup
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Library construction or watcher startup failed
    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    /// IO error (e.g., storage directory creation)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Collaborators and tunables the embedder supplies.
pub struct DaemonOptions {
    /// Maximum concurrent jobs.
    pub instances: usize,
    /// Additional plugin search path.
    pub plugin_path: Option<PathBuf>,
    /// Write-completion window for the library watchers.
    pub write_settle: Duration,
    /// Resolves plugin entry modules.
    pub loader: Arc<dyn PluginLoader>,
    /// Decides whether a path is usable media.
    pub probe: Arc<dyn MediaProbe>,
}

impl DaemonOptions {
    pub fn new(loader: Arc<dyn PluginLoader>, probe: Arc<dyn MediaProbe>) -> Self {
        Self {
            instances: 1,
            plugin_path: None,
            write_settle: DEFAULT_WRITE_SETTLE,
            loader,
            probe,
        }
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    bus: Arc<EventBus>,
    host: Arc<HostApi>,
    registry: Arc<PluginRegistry>,
    scheduler: Arc<JobScheduler>,
    runner: Arc<JobRunner>,
    libraries: LibraryManager,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Initialize the daemon.
    ///
    /// Boot order: storage directories → config → bus subscriptions for the
    /// scheduler → plugin discovery / load / initialization → action
    /// pipeline → runner → library construction. Watchers do not start
    /// until [`Daemon::launch`].
    pub async fn new(paths: &StoragePaths, options: DaemonOptions) -> Result<Self, DaemonError> {
        paths.ensure_directories()?;

        let config_file = paths.config_file();
        let config = match Config::load_if_exists(&config_file)? {
            Some(config) => config,
            None => {
                warn!(path = %config_file.display(), "no config file, running with empty configuration");
                Config::default()
            }
        };

        let bus = Arc::new(EventBus::new());
        let host = Arc::new(HostApi::new(bus.clone()));

        // The scheduler subscribes before plugins run so it observes every
        // media event, wherever it comes from.
        let scheduler = JobScheduler::new(bus.clone(), options.instances, paths.job_root());
        scheduler.attach();

        let registry = PluginRegistry::new(host.clone());
        registry.attach(&bus);
        let search = plugins::search_paths(options.plugin_path.as_deref());
        registry.discover(&config, &search);
        registry.load(options.loader.as_ref());
        registry.initialize();
        info!(plugins = registry.plugin_count(), "plugin registry ready");

        let actions = build_action_instances(&registry, &config.job_actions, &host);
        if actions.is_empty() {
            warn!("no job actions loaded; jobs will publish unchanged");
        }
        let runner = JobRunner::new(bus.clone(), scheduler.clone(), actions);
        runner.attach();

        let libraries = LibraryManager::new(
            bus.clone(),
            options.probe,
            &config.libraries,
            &config.disabled_libraries,
            options.write_settle,
        )?;

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        bus.subscribe(EventKind::Shutdown, move |_| token.cancel());

        Ok(Self {
            bus,
            host,
            registry,
            scheduler,
            runner,
            libraries,
            shutdown,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn host(&self) -> &Arc<HostApi> {
        &self.host
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Start the library watchers and announce launch completion.
    pub fn launch(&self) -> Result<(), DaemonError> {
        self.libraries.start()?;
        info!(version = %self.host.version(), "launch complete");
        self.bus.publish(Event::LaunchComplete);
        Ok(())
    }

    /// Trigger shutdown. The scheduler's shutdown handler cancels every
    /// active job before `run` returns.
    pub fn shutdown(&self) {
        self.bus.publish(Event::Shutdown);
    }

    /// Run until shutdown, then wait for in-flight job tasks to settle.
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.shutdown.cancelled().await;
        info!("shutting down");
        self.libraries.stop();
        self.runner.wait_idle().await;
        Ok(())
    }
}

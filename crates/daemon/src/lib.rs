//! Compressarr
//!
//! Long-running media-transcoding orchestrator: watches library roots for
//! media files and drives each discovery through an ordered pipeline of
//! plugin-supplied transcode actions.

pub mod actions;
pub mod bus;
pub mod daemon;
pub mod host;
pub mod library;
pub mod logging;
pub mod manifest;
pub mod paths;
pub mod plugins;
pub mod probe;
pub mod runner;
pub mod scheduler;
pub mod watcher;

pub use actions::{
    build_action_instances, Action, ActionContext, ActionError, ActionFactory, ActionIdentifier,
    ActionInstance, ActionRegistration, ResolutionError,
};
pub use bus::{Event, EventBus, EventKind};
pub use daemon::{Daemon, DaemonError, DaemonOptions};
pub use host::{ActionDeclaration, HostApi, PluginHandle, HOST_API_VERSION};
pub use library::{Library, LibraryError, LibraryManager};
pub use manifest::{PluginIdentifier, PluginManifest, HOST_NAME, PLUGIN_KEYWORD};
pub use paths::{PathsError, StoragePaths};
pub use plugins::{
    LoadedModule, Plugin, PluginError, PluginInitializer, PluginLoader, PluginRegistry,
    StaticPluginLoader,
};
pub use probe::{FfprobeMediaProbe, MediaInfo, MediaProbe, ProbeError};
pub use runner::{Job, JobRunner};
pub use scheduler::{JobConfig, JobScheduler, MediaRef};
pub use watcher::{LibraryWatcher, WatchError, WatchEvent, WatchEventKind};

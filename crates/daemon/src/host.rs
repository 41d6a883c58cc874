//! Host-facing API for plugin code
//!
//! The handle passed to plugin initializers and action instances. Every
//! method is a thin republisher onto (or subscription against) the internal
//! event bus.

use crate::actions::{ActionFactory, ActionRegistration};
use crate::bus::{Event, EventBus, EventKind};
use crate::manifest::PluginIdentifier;
use crate::scheduler::{JobConfig, MediaRef};
use semver::Version;
use std::path::PathBuf;
use std::sync::Arc;

/// Numeric API version plugins can gate features on (`>=` comparisons only).
pub const HOST_API_VERSION: u32 = 1;

/// The host surface exposed to plugins.
#[derive(Clone)]
pub struct HostApi {
    version: Version,
    bus: Arc<EventBus>,
}

impl HostApi {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            version: Version::parse(env!("CARGO_PKG_VERSION"))
                .expect("crate version is valid semver"),
            bus,
        }
    }

    /// Host version string, as checked against plugin engine ranges.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Numeric host API version.
    pub fn api_version(&self) -> u32 {
        HOST_API_VERSION
    }

    /// Whether the host API is at least the given version.
    pub fn api_at_least(&self, version: u32) -> bool {
        HOST_API_VERSION >= version
    }

    pub fn register_job(&self, source: PathBuf, config: JobConfig) {
        self.bus.publish(Event::RegisterJob { source, config });
    }

    pub fn unregister_job(&self, source: PathBuf) {
        self.bus.publish(Event::UnregisterJob { source });
    }

    pub fn publish_job(&self, source: PathBuf) {
        self.bus.publish(Event::PublishJob { source });
    }

    pub fn register_media(&self, media: MediaRef) {
        self.bus.publish(Event::RegisterMedia(media));
    }

    pub fn update_media(&self, media: MediaRef) {
        self.bus.publish(Event::UpdateMedia(media));
    }

    pub fn unregister_media(&self, media: MediaRef) {
        self.bus.publish(Event::UnregisterMedia(media));
    }

    /// Run `callback` once startup completes (plugins initialized, watchers
    /// running).
    pub fn on_launch_complete<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.bus
            .subscribe(EventKind::LaunchComplete, move |_| callback());
    }

    /// Run `callback` when the daemon begins shutting down.
    pub fn on_shutdown<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.bus.subscribe(EventKind::Shutdown, move |_| callback());
    }
}

/// What a plugin states about an action it contributes.
///
/// `plugin` is the plugin's own idea of its identifier; it may be absent or
/// wrong, and the registry reconciles it against the handle's binding.
pub struct ActionDeclaration {
    pub plugin: Option<String>,
    pub name: String,
    pub factory: ActionFactory,
}

/// Host API handle bound to one plugin.
///
/// Handed to that plugin's initializer, so every registration made through it
/// carries the owning identifier explicitly.
#[derive(Clone)]
pub struct PluginHandle {
    host: Arc<HostApi>,
    plugin: PluginIdentifier,
}

impl PluginHandle {
    pub fn new(host: Arc<HostApi>, plugin: PluginIdentifier) -> Self {
        Self { host, plugin }
    }

    /// The identifier this handle is bound to.
    pub fn plugin(&self) -> &PluginIdentifier {
        &self.plugin
    }

    /// The full host API.
    pub fn host(&self) -> &Arc<HostApi> {
        &self.host
    }

    /// Contribute an action constructor on behalf of the bound plugin.
    pub fn register_action(&self, declaration: ActionDeclaration) {
        self.host
            .bus
            .publish(Event::RegisterAction(ActionRegistration {
                owner: self.plugin.clone(),
                declared_plugin: declaration.plugin,
                name: declaration.name,
                factory: declaration.factory,
            }));
    }
}

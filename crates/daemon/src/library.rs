//! Library management
//!
//! Owns one watcher per configured library root and bridges its events onto
//! the bus as media events, filtered through the media probe. Nonexistent
//! roots are dropped with a warning; disabled libraries are constructed but
//! never start watching.

use crate::bus::{Event, EventBus};
use crate::probe::MediaProbe;
use crate::scheduler::MediaRef;
use crate::watcher::{LibraryWatcher, WatchError, WatchEventKind};
use compressarr_config::LibraryConfig;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Error type for library construction and startup
#[derive(Debug, Error)]
pub enum LibraryError {
    /// Two libraries share a name.
    #[error("Duplicate library name: {0}")]
    DuplicateName(String),

    /// A watcher could not be started.
    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// One configured library.
#[derive(Debug, Clone)]
pub struct Library {
    pub name: String,
    /// Canonical root path.
    pub root: PathBuf,
    pub disabled: bool,
}

/// Builds libraries from configuration and runs their watchers.
pub struct LibraryManager {
    bus: Arc<EventBus>,
    probe: Arc<dyn MediaProbe>,
    settle: Duration,
    libraries: Vec<Library>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LibraryManager {
    /// Construct libraries from config entries.
    ///
    /// Entries whose root does not exist are skipped with a warning. Names
    /// must be unique. Entries on the deny-list are kept (so their config
    /// stays visible in diagnostics) but never watched.
    pub fn new(
        bus: Arc<EventBus>,
        probe: Arc<dyn MediaProbe>,
        configs: &[LibraryConfig],
        disabled_libraries: &[String],
        settle: Duration,
    ) -> Result<Self, LibraryError> {
        let mut names = HashSet::new();
        let mut libraries = Vec::new();

        for config in configs {
            if !names.insert(config.name.clone()) {
                return Err(LibraryError::DuplicateName(config.name.clone()));
            }

            let root = match config.library.canonicalize() {
                Ok(root) if root.is_dir() => root,
                _ => {
                    warn!(
                        library = %config.name,
                        root = %config.library.display(),
                        "library root does not exist, skipping"
                    );
                    continue;
                }
            };

            let disabled = disabled_libraries.iter().any(|d| d == &config.name);
            if disabled {
                info!(library = %config.name, "library disabled");
            }

            libraries.push(Library {
                name: config.name.clone(),
                root,
                disabled,
            });
        }

        Ok(Self {
            bus,
            probe,
            settle,
            libraries,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn libraries(&self) -> &[Library] {
        &self.libraries
    }

    /// Start a watcher task for every enabled library.
    pub fn start(&self) -> Result<(), LibraryError> {
        for library in &self.libraries {
            if library.disabled {
                continue;
            }

            let watcher = LibraryWatcher::start(&library.root, self.settle)?;
            info!(library = %library.name, root = %library.root.display(), "watching library");

            let bus = self.bus.clone();
            let probe = self.probe.clone();
            let root = library.root.clone();
            let handle = tokio::spawn(run_library(bus, probe, root, watcher));
            self.tasks
                .lock()
                .expect("library task list poisoned")
                .push(handle);
        }
        Ok(())
    }

    /// Abort watcher tasks. Watchers and their channels are dropped with
    /// the tasks.
    pub fn stop(&self) {
        for handle in self
            .tasks
            .lock()
            .expect("library task list poisoned")
            .drain(..)
        {
            handle.abort();
        }
    }
}

/// Per-library loop: probe each added/changed path and republish as media
/// events with root-relative identity. Removals skip the probe.
async fn run_library(
    bus: Arc<EventBus>,
    probe: Arc<dyn MediaProbe>,
    root: PathBuf,
    mut watcher: LibraryWatcher,
) {
    while let Some(event) = watcher.recv().await {
        let Ok(relative) = event.path.strip_prefix(&root) else {
            warn!(path = %event.path.display(), "event outside library root, ignoring");
            continue;
        };
        let media = MediaRef {
            library_root: root.clone(),
            relative_path: relative.to_path_buf(),
        };

        match event.kind {
            WatchEventKind::Removed => {
                bus.publish(Event::UnregisterMedia(media));
            }
            WatchEventKind::Added | WatchEventKind::Changed => {
                if !probe_is_media(&probe, &event.path).await {
                    debug!(path = %event.path.display(), "not usable media, dropping event");
                    continue;
                }
                match event.kind {
                    WatchEventKind::Added => bus.publish(Event::RegisterMedia(media)),
                    _ => bus.publish(Event::UpdateMedia(media)),
                }
            }
        }
    }
}

/// Run the (blocking) probe off the async task. Probe failures count as
/// "not media".
async fn probe_is_media(probe: &Arc<dyn MediaProbe>, path: &Path) -> bool {
    let probe = probe.clone();
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || probe.probe(&path)).await;

    match result {
        Ok(Ok(Some(_))) => true,
        Ok(Ok(None)) => false,
        Ok(Err(error)) => {
            debug!(%error, "probe failed, treating as non-media");
            false
        }
        Err(join_error) => {
            warn!(%join_error, "probe task failed");
            false
        }
    }
}

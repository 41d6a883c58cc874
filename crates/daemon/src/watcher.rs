//! Filesystem watching for library roots
//!
//! Translates raw filesystem activity under one root into added / changed /
//! removed events. Live notifications come from the platform watcher; files
//! already present at startup are swept once so they are discovered too.
//! Added and changed events are held until the file's size stops moving, so
//! half-written files never reach the probe.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Default window for the write-completion check.
pub const DEFAULT_WRITE_SETTLE: Duration = Duration::from_secs(2);

/// Error type for watcher setup
#[derive(Debug, Error)]
pub enum WatchError {
    /// The root does not exist or is not a directory.
    #[error("Library root does not exist: {0}")]
    MissingRoot(PathBuf),

    /// Root canonicalization failed.
    #[error("Failed to canonicalize {path}: {source}")]
    Canonicalize {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The platform watcher could not be created or attached.
    #[error("Failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Changed,
    Removed,
}

/// A normalized filesystem event under a watched root.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Absolute path under the (canonical) root.
    pub path: PathBuf,
}

/// Whether any component of `path` below `root` is a dot-entry.
fn is_hidden(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    relative.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
    })
}

/// Sample the file size across the settle window until it stops changing.
/// Returns immediately when the file disappears mid-check.
async fn wait_for_write_completion(path: &Path, settle: Duration) {
    loop {
        let Ok(before) = fs::metadata(path) else { return };
        tokio::time::sleep(settle).await;
        let Ok(after) = fs::metadata(path) else { return };
        if before.len() == after.len() {
            return;
        }
        debug!(path = %path.display(), "file still growing, holding event");
    }
}

/// Watches one library root.
///
/// Dropping the watcher detaches the platform watch; the pending event
/// stream ends shortly after.
pub struct LibraryWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
    events: mpsc::UnboundedReceiver<WatchEvent>,
}

impl LibraryWatcher {
    /// Start watching `root` recursively.
    ///
    /// The root is canonicalized first so every emitted path (and everything
    /// keyed on it downstream) uses the canonical form. Dot-entries are
    /// ignored. Files already on disk are reported as `Added`.
    pub fn start(root: &Path, settle: Duration) -> Result<Self, WatchError> {
        if !root.is_dir() {
            return Err(WatchError::MissingRoot(root.to_path_buf()));
        }
        let root = root
            .canonicalize()
            .map_err(|source| WatchError::Canonicalize {
                path: root.to_path_buf(),
                source,
            })?;

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<WatchEvent>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<WatchEvent>();

        // Live watch. The callback runs on the platform watcher's thread;
        // it only classifies and forwards.
        let callback_root = root.clone();
        let callback_tx = raw_tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    let kind = match event.kind {
                        EventKind::Create(_) => WatchEventKind::Added,
                        EventKind::Modify(_) => WatchEventKind::Changed,
                        EventKind::Remove(_) => WatchEventKind::Removed,
                        _ => return,
                    };
                    for path in event.paths {
                        if is_hidden(&callback_root, &path) {
                            continue;
                        }
                        let _ = callback_tx.send(WatchEvent { kind, path });
                    }
                }
                Err(error) => warn!(%error, "filesystem watch error"),
            },
            notify::Config::default(),
        )
        .map_err(|source| WatchError::Watch {
            path: root.clone(),
            source,
        })?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                path: root.clone(),
                source,
            })?;

        // One-time sweep for files that were already there. These went
        // through their writes long ago, so they skip the settle gate.
        {
            let sweep_root = root.clone();
            let sweep_tx = out_tx.clone();
            tokio::task::spawn_blocking(move || {
                let walker = WalkDir::new(&sweep_root)
                    .follow_links(true)
                    .into_iter()
                    .filter_entry(|entry| {
                        entry.depth() == 0
                            || !entry
                                .file_name()
                                .to_str()
                                .map(|s| s.starts_with('.'))
                                .unwrap_or(false)
                    });
                for entry in walker.filter_map(|e| e.ok()) {
                    if entry.file_type().is_file() {
                        let _ = sweep_tx.send(WatchEvent {
                            kind: WatchEventKind::Added,
                            path: entry.into_path(),
                        });
                    }
                }
            });
        }

        // Write-completion gate between raw events and the consumer.
        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                match event.kind {
                    WatchEventKind::Removed => {
                        let _ = out_tx.send(event);
                    }
                    WatchEventKind::Added | WatchEventKind::Changed => {
                        wait_for_write_completion(&event.path, settle).await;
                        // Stat the entry: a path that vanished while we
                        // waited (or was a directory all along) is dropped.
                        if event.path.is_file() {
                            let _ = out_tx.send(event);
                        }
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            root,
            events: out_rx,
        })
    }

    /// The canonical root being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Receive the next event; `None` once the watcher is torn down.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }
}

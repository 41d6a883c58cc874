//! Storage root resolution and derived subpaths
//!
//! The storage root holds `config.json` and the daemon's working directories.
//! It may be overridden until the first read; once any component has resolved
//! a path from it, further overrides fail.

use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

/// Error type for storage path operations
#[derive(Debug, Error)]
pub enum PathsError {
    /// The root was already read; it can no longer be changed.
    #[error("Storage root is locked after first use (was {0})")]
    RootLocked(PathBuf),
}

#[derive(Debug)]
struct State {
    root: PathBuf,
    job_root: Option<PathBuf>,
    locked: bool,
}

/// Resolves the storage root and the paths derived from it.
#[derive(Debug)]
pub struct StoragePaths {
    state: Mutex<State>,
}

impl StoragePaths {
    /// Create a resolver rooted at `root` (unlocked until first read).
    pub fn new(root: PathBuf) -> Self {
        Self {
            state: Mutex::new(State {
                root,
                job_root: None,
                locked: false,
            }),
        }
    }

    /// The platform default storage root: `~/.compressarr`.
    pub fn default_root() -> PathBuf {
        let home = if cfg!(windows) {
            env::var_os("USERPROFILE")
        } else {
            env::var_os("HOME")
        };
        home.map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".compressarr")
    }

    /// Override the storage root.
    ///
    /// Fails once the root has been read: components resolve paths against
    /// it lazily and a late change would split state across two roots.
    pub fn set_root(&self, root: PathBuf) -> Result<(), PathsError> {
        let mut state = self.state.lock().expect("paths state poisoned");
        if state.locked {
            return Err(PathsError::RootLocked(state.root.clone()));
        }
        state.root = root;
        Ok(())
    }

    /// Override the job temp-root (defaults to `<root>/jobs`).
    pub fn set_job_root(&self, job_root: PathBuf) {
        let mut state = self.state.lock().expect("paths state poisoned");
        state.job_root = Some(job_root);
    }

    /// The storage root. Reading latches the one-shot lock.
    pub fn root(&self) -> PathBuf {
        let mut state = self.state.lock().expect("paths state poisoned");
        state.locked = true;
        state.root.clone()
    }

    /// `<root>/config.json`
    pub fn config_file(&self) -> PathBuf {
        self.root().join("config.json")
    }

    /// The job temp-root: the override if set, else `<root>/jobs`.
    pub fn job_root(&self) -> PathBuf {
        {
            let mut state = self.state.lock().expect("paths state poisoned");
            state.locked = true;
            if let Some(job_root) = &state.job_root {
                return job_root.clone();
            }
        }
        self.root().join("jobs")
    }

    /// `<root>/persist` (reserved).
    pub fn persist_dir(&self) -> PathBuf {
        self.root().join("persist")
    }

    /// `<root>/job actions` (reserved).
    pub fn job_actions_dir(&self) -> PathBuf {
        self.root().join("job actions")
    }

    /// Create the storage root and its working directories.
    pub fn ensure_directories(&self) -> Result<(), io::Error> {
        fs::create_dir_all(self.root())?;
        fs::create_dir_all(self.job_root())?;
        fs::create_dir_all(self.persist_dir())?;
        fs::create_dir_all(self.job_actions_dir())?;
        Ok(())
    }
}

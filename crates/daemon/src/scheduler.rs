//! Job scheduling: pending queue, active table, admission control
//!
//! Converts media events into pending jobs and admits them into the active
//! table under the concurrency cap. Table mutations happen inside bus
//! handlers or behind the table mutex; admission decisions always run in one
//! critical section, and the resulting `RegisterJob` publications follow in
//! decision order once the lock is released.

use crate::bus::{Event, EventBus, EventKind};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Identity of a discovered media item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaRef {
    /// Root of the library that discovered it.
    pub library_root: PathBuf,
    /// Path relative to that root.
    pub relative_path: PathBuf,
}

/// Immutable description of a job, fixed at scheduling time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Display name (the media file's stem).
    pub name: String,
    /// Absolute source path; also the job identifier.
    pub source_path: PathBuf,
    /// Directory + stem under the job root where intermediates are created.
    pub temp_prefix: PathBuf,
}

#[derive(Debug, Default)]
struct Tables {
    /// Insertion-ordered, at most one entry per source path.
    pending: VecDeque<(PathBuf, JobConfig)>,
    /// Jobs currently executing, bounded by `instances`.
    active: HashMap<PathBuf, JobConfig>,
}

impl Tables {
    /// Insert or overwrite a pending entry. An existing entry keeps its
    /// queue position; only its config is replaced.
    fn upsert_pending(&mut self, config: JobConfig) {
        let source = config.source_path.clone();
        match self.pending.iter().position(|(s, _)| s == &source) {
            Some(index) => self.pending[index].1 = config,
            None => self.pending.push_back((source, config)),
        }
    }

    fn remove_pending(&mut self, source: &Path) -> bool {
        let before = self.pending.len();
        self.pending.retain(|(s, _)| s != source);
        self.pending.len() != before
    }
}

/// Converts media events into jobs and drives admission.
pub struct JobScheduler {
    bus: Arc<EventBus>,
    /// Concurrency cap: maximum size of the active table.
    instances: usize,
    job_root: PathBuf,
    tables: Mutex<Tables>,
}

impl JobScheduler {
    pub fn new(bus: Arc<EventBus>, instances: usize, job_root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            bus,
            instances,
            job_root,
            tables: Mutex::new(Tables::default()),
        })
    }

    /// Subscribe the scheduler's handlers on the bus.
    pub fn attach(self: &Arc<Self>) {
        let s = self.clone();
        self.bus.subscribe(EventKind::RegisterMedia, move |event| {
            if let Event::RegisterMedia(media) = event {
                s.on_register_media(media);
            }
        });

        let s = self.clone();
        self.bus.subscribe(EventKind::UpdateMedia, move |event| {
            if let Event::UpdateMedia(media) = event {
                s.on_update_media(media);
            }
        });

        let s = self.clone();
        self.bus.subscribe(EventKind::UnregisterMedia, move |event| {
            if let Event::UnregisterMedia(media) = event {
                s.on_unregister_media(media);
            }
        });

        let s = self.clone();
        self.bus.subscribe(EventKind::PublishJob, move |event| {
            if let Event::PublishJob { source } = event {
                s.on_publish_job(source);
            }
        });

        let s = self.clone();
        self.bus.subscribe(EventKind::Shutdown, move |_| s.teardown());
    }

    /// Derive the job config for a media item: source under the library
    /// root, temp prefix under the job root mirroring the relative layout.
    fn job_config(&self, media: &MediaRef) -> JobConfig {
        let source_path = media.library_root.join(&media.relative_path);
        let stem = media
            .relative_path
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| media.relative_path.as_os_str().to_os_string());
        let parent = media.relative_path.parent().unwrap_or_else(|| Path::new(""));
        let temp_prefix = self.job_root.join(parent).join(&stem);

        JobConfig {
            name: stem.to_string_lossy().into_owned(),
            source_path,
            temp_prefix,
        }
    }

    fn on_register_media(&self, media: &MediaRef) {
        let config = self.job_config(media);
        debug!(source = %config.source_path.display(), "media registered, job pending");
        {
            let mut tables = self.tables.lock().expect("scheduler tables poisoned");
            // An active path stays out of pending; a change to a running
            // job arrives as UpdateMedia, which cancels first.
            if tables.active.contains_key(&config.source_path) {
                return;
            }
            tables.upsert_pending(config);
        }
        self.advance();
    }

    fn on_update_media(&self, media: &MediaRef) {
        let config = self.job_config(media);
        let source = config.source_path.clone();
        debug!(source = %source.display(), "media updated, re-queueing job");
        {
            let mut tables = self.tables.lock().expect("scheduler tables poisoned");
            tables.upsert_pending(config);
            tables.active.remove(&source);
        }
        self.bus.publish(Event::UnregisterJob { source });
        self.advance();
    }

    fn on_unregister_media(&self, media: &MediaRef) {
        let source = media.library_root.join(&media.relative_path);
        debug!(source = %source.display(), "media unregistered, dropping job");
        {
            let mut tables = self.tables.lock().expect("scheduler tables poisoned");
            tables.remove_pending(&source);
            tables.active.remove(&source);
        }
        self.bus.publish(Event::UnregisterJob { source });
        self.advance();
    }

    fn on_publish_job(&self, source: &Path) {
        {
            let mut tables = self.tables.lock().expect("scheduler tables poisoned");
            tables.remove_pending(source);
            tables.active.remove(source);
        }
        self.advance();
    }

    /// Admit pending jobs while slots are free.
    ///
    /// Decisions (pop + insert) run in one critical section; the
    /// corresponding `RegisterJob` events publish after the lock is
    /// released, in admission order.
    fn advance(&self) {
        let admitted: Vec<(PathBuf, JobConfig)> = {
            let mut tables = self.tables.lock().expect("scheduler tables poisoned");
            let mut admitted = Vec::new();
            while !tables.pending.is_empty() && tables.active.len() < self.instances {
                let (source, config) = tables
                    .pending
                    .pop_front()
                    .expect("pending checked non-empty");
                tables.active.insert(source.clone(), config.clone());
                admitted.push((source, config));
            }
            admitted
        };

        for (source, config) in admitted {
            debug!(source = %source.display(), "job admitted");
            self.bus.publish(Event::RegisterJob { source, config });
        }
    }

    /// Whether a source currently holds an active slot. Runner tasks call
    /// this before every action step.
    pub fn is_active(&self, source: &Path) -> bool {
        self.tables
            .lock()
            .expect("scheduler tables poisoned")
            .active
            .contains_key(source)
    }

    /// Remove an active entry without advancing. The runner uses this right
    /// before publishing the job; the `PublishJob` handler then advances.
    pub fn remove_active(&self, source: &Path) -> bool {
        self.tables
            .lock()
            .expect("scheduler tables poisoned")
            .active
            .remove(source)
            .is_some()
    }

    /// Release a slot for a job that terminated without publication (action
    /// failure) and admit the next pending job.
    pub fn release(&self, source: &Path) {
        self.remove_active(source);
        self.advance();
    }

    /// Shutdown path: cancel every active job and drain pending. Runner
    /// tasks settle on their own; the daemon waits for them.
    fn teardown(&self) {
        let actives: Vec<PathBuf> = {
            let mut tables = self.tables.lock().expect("scheduler tables poisoned");
            tables.pending.clear();
            let actives = tables.active.keys().cloned().collect();
            tables.active.clear();
            actives
        };
        for source in actives {
            self.bus.publish(Event::UnregisterJob { source });
        }
    }

    pub fn pending_count(&self) -> usize {
        self.tables
            .lock()
            .expect("scheduler tables poisoned")
            .pending
            .len()
    }

    pub fn active_count(&self) -> usize {
        self.tables
            .lock()
            .expect("scheduler tables poisoned")
            .active
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn media(root: &str, rel: &str) -> MediaRef {
        MediaRef {
            library_root: PathBuf::from(root),
            relative_path: PathBuf::from(rel),
        }
    }

    /// Records RegisterJob / UnregisterJob publications in order.
    fn recorder(bus: &Arc<EventBus>) -> Arc<StdMutex<Vec<String>>> {
        let log = Arc::new(StdMutex::new(Vec::new()));

        let l = log.clone();
        bus.subscribe(EventKind::RegisterJob, move |event| {
            if let Event::RegisterJob { source, .. } = event {
                l.lock().unwrap().push(format!("register:{}", source.display()));
            }
        });
        let l = log.clone();
        bus.subscribe(EventKind::UnregisterJob, move |event| {
            if let Event::UnregisterJob { source } = event {
                l.lock()
                    .unwrap()
                    .push(format!("unregister:{}", source.display()));
            }
        });

        log
    }

    fn setup(instances: usize) -> (Arc<EventBus>, Arc<JobScheduler>, Arc<StdMutex<Vec<String>>>) {
        let bus = Arc::new(EventBus::new());
        let scheduler = JobScheduler::new(bus.clone(), instances, PathBuf::from("/s/jobs"));
        scheduler.attach();
        let log = recorder(&bus);
        (bus, scheduler, log)
    }

    #[test]
    fn test_register_media_admits_and_derives_paths() {
        let bus = Arc::new(EventBus::new());
        let scheduler = JobScheduler::new(bus.clone(), 1, PathBuf::from("/s/jobs"));
        scheduler.attach();

        let configs = Arc::new(StdMutex::new(Vec::new()));
        let c = configs.clone();
        bus.subscribe(EventKind::RegisterJob, move |event| {
            if let Event::RegisterJob { config, .. } = event {
                c.lock().unwrap().push(config.clone());
            }
        });

        bus.publish(Event::RegisterMedia(media("/lib", "shows/x.mp4")));

        let configs = configs.lock().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "x");
        assert_eq!(configs[0].source_path, PathBuf::from("/lib/shows/x.mp4"));
        assert_eq!(configs[0].temp_prefix, PathBuf::from("/s/jobs/shows/x"));
        assert_eq!(scheduler.active_count(), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_admission_cap_respected() {
        let (bus, scheduler, log) = setup(2);

        bus.publish(Event::RegisterMedia(media("/lib", "a.mp4")));
        bus.publish(Event::RegisterMedia(media("/lib", "b.mp4")));
        bus.publish(Event::RegisterMedia(media("/lib", "c.mp4")));

        assert_eq!(scheduler.active_count(), 2);
        assert_eq!(scheduler.pending_count(), 1);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["register:/lib/a.mp4", "register:/lib/b.mp4"]
        );

        // First publish releases a slot; c is admitted.
        bus.publish(Event::PublishJob {
            source: PathBuf::from("/lib/a.mp4"),
        });

        assert_eq!(scheduler.active_count(), 2);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(log.lock().unwrap().last().unwrap(), "register:/lib/c.mp4");
    }

    #[test]
    fn test_duplicate_register_collapses_keeping_position() {
        let (bus, scheduler, log) = setup(0);

        bus.publish(Event::RegisterMedia(media("/lib", "a.mp4")));
        bus.publish(Event::RegisterMedia(media("/lib", "b.mp4")));
        bus.publish(Event::RegisterMedia(media("/lib", "a.mp4")));

        assert_eq!(scheduler.pending_count(), 2);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_register_then_unregister_leaves_tables_empty() {
        let (bus, scheduler, log) = setup(0);

        bus.publish(Event::RegisterMedia(media("/lib", "x.mp4")));
        bus.publish(Event::UnregisterMedia(media("/lib", "x.mp4")));

        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.active_count(), 0);
        // Only the unregister-job publication; nothing was ever admitted.
        assert_eq!(log.lock().unwrap().as_slice(), &["unregister:/lib/x.mp4"]);
    }

    #[test]
    fn test_unregister_active_media_cancels_and_admits_next() {
        let (bus, scheduler, log) = setup(1);

        bus.publish(Event::RegisterMedia(media("/lib", "a.mp4")));
        bus.publish(Event::RegisterMedia(media("/lib", "b.mp4")));
        assert_eq!(scheduler.active_count(), 1);
        assert_eq!(scheduler.pending_count(), 1);

        bus.publish(Event::UnregisterMedia(media("/lib", "a.mp4")));

        assert!(!scheduler.is_active(Path::new("/lib/a.mp4")));
        assert!(scheduler.is_active(Path::new("/lib/b.mp4")));
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[
                "register:/lib/a.mp4",
                "unregister:/lib/a.mp4",
                "register:/lib/b.mp4"
            ]
        );
    }

    #[test]
    fn test_update_media_cancels_and_requeues() {
        let (bus, scheduler, log) = setup(1);

        bus.publish(Event::RegisterMedia(media("/lib", "y.mp4")));
        assert!(scheduler.is_active(Path::new("/lib/y.mp4")));

        bus.publish(Event::UpdateMedia(media("/lib", "y.mp4")));

        // The old admission is cancelled and the path re-admitted from
        // pending (the slot freed up immediately).
        assert!(scheduler.is_active(Path::new("/lib/y.mp4")));
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[
                "register:/lib/y.mp4",
                "unregister:/lib/y.mp4",
                "register:/lib/y.mp4"
            ]
        );
    }

    #[test]
    fn test_single_instance_is_sequential() {
        let (bus, scheduler, log) = setup(1);

        for name in ["a.mp4", "b.mp4", "c.mp4"] {
            bus.publish(Event::RegisterMedia(media("/lib", name)));
        }
        assert_eq!(scheduler.active_count(), 1);

        for expected in ["/lib/a.mp4", "/lib/b.mp4", "/lib/c.mp4"] {
            assert_eq!(
                log.lock().unwrap().last().unwrap(),
                &format!("register:{}", expected)
            );
            bus.publish(Event::PublishJob {
                source: PathBuf::from(expected),
            });
        }

        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_advance_terminates_with_spare_slots() {
        let (bus, scheduler, _log) = setup(8);

        bus.publish(Event::RegisterMedia(media("/lib", "only.mp4")));

        assert_eq!(scheduler.active_count(), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_release_frees_slot_without_publication() {
        let (bus, scheduler, log) = setup(1);

        bus.publish(Event::RegisterMedia(media("/lib", "a.mp4")));
        bus.publish(Event::RegisterMedia(media("/lib", "b.mp4")));

        // Action failure path: no publish, but the slot opens up.
        scheduler.release(Path::new("/lib/a.mp4"));

        assert!(scheduler.is_active(Path::new("/lib/b.mp4")));
        assert_eq!(log.lock().unwrap().last().unwrap(), "register:/lib/b.mp4");
    }

    #[test]
    fn test_teardown_cancels_everything() {
        let (bus, scheduler, log) = setup(2);

        bus.publish(Event::RegisterMedia(media("/lib", "a.mp4")));
        bus.publish(Event::RegisterMedia(media("/lib", "b.mp4")));
        bus.publish(Event::RegisterMedia(media("/lib", "c.mp4")));

        bus.publish(Event::Shutdown);

        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.pending_count(), 0);
        let log = log.lock().unwrap();
        assert!(log.contains(&"unregister:/lib/a.mp4".to_string()));
        assert!(log.contains(&"unregister:/lib/b.mp4".to_string()));
        // c was still pending; it is drained, not cancelled.
        assert!(!log.contains(&"unregister:/lib/c.mp4".to_string()));
    }

    #[test]
    fn test_no_path_in_both_tables() {
        let (bus, scheduler, _log) = setup(1);

        bus.publish(Event::RegisterMedia(media("/lib", "a.mp4")));
        assert!(scheduler.is_active(Path::new("/lib/a.mp4")));

        // A re-register for an active path must not create a pending twin.
        bus.publish(Event::RegisterMedia(media("/lib", "a.mp4")));
        assert_eq!(scheduler.pending_count(), 0);

        // An update re-queues, but removes the active entry in the same
        // critical section, so the path still lives in exactly one table.
        bus.publish(Event::UpdateMedia(media("/lib", "a.mp4")));
        assert_eq!(scheduler.active_count() + scheduler.pending_count(), 1);
    }
}

//! Job runner: drives admitted jobs through the action pipeline
//!
//! One task per admitted job; actions within a job run strictly in sequence.
//! The runner re-checks active membership before every step so a cancellation
//! published before the first action still prevents it from starting.

use crate::actions::{ActionError, ActionInstance};
use crate::bus::{Event, EventBus, EventKind};
use crate::scheduler::{JobConfig, JobScheduler};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Mutable per-job context threaded through the action pipeline.
#[derive(Debug, Clone)]
pub struct Job {
    /// Display name (the media file's stem).
    pub name: String,
    /// The path that triggered the job; also its identifier.
    pub original_source: PathBuf,
    /// Directory + stem under which intermediates are allocated.
    pub temp_prefix: PathBuf,
    /// Input for the next action; rewritten by actions that produce
    /// intermediate artifacts.
    pub current_source: PathBuf,
    dest_counter: u32,
    allocated: Vec<PathBuf>,
}

impl Job {
    pub fn new(config: &JobConfig) -> Self {
        Self {
            name: config.name.clone(),
            original_source: config.source_path.clone(),
            temp_prefix: config.temp_prefix.clone(),
            current_source: config.source_path.clone(),
            dest_counter: 0,
            allocated: Vec::new(),
        }
    }

    /// The job identifier: the original source path.
    pub fn id(&self) -> &Path {
        &self.original_source
    }

    /// Allocate the next intermediate destination under the temp prefix.
    ///
    /// Picks the smallest untaken `<temp-prefix>-<i>` with `i >= 1`,
    /// advancing the counter before each existence check so an occupied
    /// index can never be retried. An extension is appended as `.<ext>`
    /// after stripping leading dots. The counter is a plain field: the job
    /// is exclusively owned by its runner task, so allocation cannot race.
    pub fn next_destination(&mut self, extension: Option<&str>) -> PathBuf {
        let extension = extension
            .map(|e| e.trim_start_matches('.'))
            .filter(|e| !e.is_empty());

        loop {
            self.dest_counter += 1;
            let mut name = self.temp_prefix.as_os_str().to_os_string();
            name.push(format!("-{}", self.dest_counter));
            if let Some(ext) = extension {
                name.push(".");
                name.push(ext);
            }

            let candidate = PathBuf::from(&name);
            if !candidate.exists() {
                self.allocated.push(candidate.clone());
                return candidate;
            }
        }
    }

    /// Destinations handed out so far, for post-run cleanup.
    pub fn allocated_destinations(&self) -> &[PathBuf] {
        &self.allocated
    }
}

/// Move the final artifact over the original path.
///
/// Rename when both live on one filesystem; copy-then-remove otherwise.
fn move_into_place(artifact: &Path, original: &Path) -> Result<(), io::Error> {
    if fs::rename(artifact, original).is_ok() {
        return Ok(());
    }
    fs::copy(artifact, original)?;
    fs::remove_file(artifact)?;
    Ok(())
}

/// Best-effort removal of a job's working files; errors are swallowed.
fn cleanup_temp(job: &Job) {
    let prefix = &job.temp_prefix;
    if prefix.is_dir() {
        let _ = fs::remove_dir_all(prefix);
    } else if prefix.exists() {
        let _ = fs::remove_file(prefix);
    }
    for path in job.allocated_destinations() {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }
}

/// Spawns and supervises one task per admitted job.
pub struct JobRunner {
    bus: Arc<EventBus>,
    scheduler: Arc<JobScheduler>,
    actions: Vec<Arc<ActionInstance>>,
    runtime: tokio::runtime::Handle,
    /// Source → index of the action currently inside `start`. Lets the
    /// unregister handler kill only the instance that owns the job.
    in_flight: Mutex<HashMap<PathBuf, usize>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobRunner {
    /// Build the runner. Must be called from within the tokio runtime that
    /// will execute job tasks.
    pub fn new(
        bus: Arc<EventBus>,
        scheduler: Arc<JobScheduler>,
        actions: Vec<Arc<ActionInstance>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            scheduler,
            actions,
            runtime: tokio::runtime::Handle::current(),
            in_flight: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe the runner's handlers on the bus.
    pub fn attach(self: &Arc<Self>) {
        let runner = self.clone();
        self.bus.subscribe(EventKind::RegisterJob, move |event| {
            if let Event::RegisterJob { source, config } = event {
                runner.spawn_job(source.clone(), config.clone());
            }
        });

        let runner = self.clone();
        self.bus.subscribe(EventKind::UnregisterJob, move |event| {
            if let Event::UnregisterJob { source } = event {
                runner.kill_owner(source);
            }
        });
    }

    fn spawn_job(self: &Arc<Self>, source: PathBuf, config: JobConfig) {
        let runner = self.clone();
        let handle = self.runtime.spawn(runner.run_job(source, config));

        let mut tasks = self.tasks.lock().expect("runner task list poisoned");
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Ask the instance currently inside `start` for this source to stop.
    /// Jobs sitting between actions have no owner; they are caught by the
    /// active-table re-check at the next boundary instead.
    fn kill_owner(&self, source: &Path) {
        let owner = self
            .in_flight
            .lock()
            .expect("in-flight table poisoned")
            .get(source)
            .copied();

        let Some(index) = owner else { return };
        let Some(action) = self.actions.get(index).cloned() else {
            return;
        };

        let source = source.to_path_buf();
        self.runtime.spawn(async move {
            if let Err(error) = action.kill(&source).await {
                warn!(source = %source.display(), action = %action.display_name, %error, "kill failed");
            }
        });
    }

    fn clear_in_flight(&self, source: &Path) {
        self.in_flight
            .lock()
            .expect("in-flight table poisoned")
            .remove(source);
    }

    async fn run_job(self: Arc<Self>, source: PathBuf, config: JobConfig) {
        let mut job = Job::new(&config);
        debug!(source = %source.display(), name = %job.name, "job started");

        for (index, action) in self.actions.iter().enumerate() {
            // A cancellation that landed before this boundary must win,
            // even if it arrived before the first action.
            if !self.scheduler.is_active(&source) {
                debug!(source = %source.display(), "job cancelled before step");
                self.clear_in_flight(&source);
                return;
            }

            self.in_flight
                .lock()
                .expect("in-flight table poisoned")
                .insert(source.clone(), index);

            match action.start(job).await {
                Ok(updated) => job = updated,
                Err(ActionError::Killed) => {
                    debug!(source = %source.display(), action = %action.display_name, "action killed");
                    self.clear_in_flight(&source);
                    return;
                }
                Err(error) => {
                    error!(
                        source = %source.display(),
                        action = %action.display_name,
                        %error,
                        "action failed, abandoning job"
                    );
                    self.clear_in_flight(&source);
                    self.scheduler.release(&source);
                    return;
                }
            }
        }

        self.clear_in_flight(&source);

        if !self.scheduler.is_active(&source) {
            debug!(source = %source.display(), "job cancelled after final step");
            return;
        }

        if job.current_source != job.original_source {
            if let Err(error) = move_into_place(&job.current_source, &job.original_source) {
                error!(
                    source = %source.display(),
                    artifact = %job.current_source.display(),
                    %error,
                    "failed to move artifact into place"
                );
                self.scheduler.release(&source);
                return;
            }
        }

        self.scheduler.remove_active(&source);
        cleanup_temp(&job);
        info!(source = %source.display(), name = %job.name, "job published");
        self.bus.publish(Event::PublishJob { source });
    }

    /// Wait for every spawned job task to settle. Used by the shutdown path
    /// after the scheduler has cancelled the active set.
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut tasks = self.tasks.lock().expect("runner task list poisoned");
                std::mem::take(&mut *tasks)
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionInstance};
    use crate::manifest::PluginIdentifier;
    use crate::scheduler::MediaRef;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, stem: &str) -> JobConfig {
        JobConfig {
            name: stem.to_string(),
            source_path: dir.path().join(format!("{}.mp4", stem)),
            temp_prefix: dir.path().join("jobs").join(stem),
        }
    }

    #[test]
    fn test_next_destination_counts_up() {
        let dir = TempDir::new().unwrap();
        let mut job = Job::new(&test_config(&dir, "x"));

        let first = job.next_destination(None);
        let second = job.next_destination(Some("mkv"));

        assert_eq!(first, dir.path().join("jobs/x-1"));
        assert_eq!(second, dir.path().join("jobs/x-2.mkv"));
        assert_eq!(job.allocated_destinations().len(), 2);
    }

    #[test]
    fn test_next_destination_skips_existing() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("jobs")).unwrap();
        fs::write(dir.path().join("jobs/x-1.mkv"), b"taken").unwrap();

        let mut job = Job::new(&test_config(&dir, "x"));
        let dest = job.next_destination(Some("mkv"));

        assert_eq!(dest, dir.path().join("jobs/x-2.mkv"));
    }

    #[test]
    fn test_next_destination_strips_leading_dots() {
        let dir = TempDir::new().unwrap();
        let mut job = Job::new(&test_config(&dir, "x"));

        let dest = job.next_destination(Some("..mkv"));
        assert_eq!(dest, dir.path().join("jobs/x-1.mkv"));
    }

    #[test]
    fn test_job_id_is_original_source() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir, "x");
        let job = Job::new(&config);
        assert_eq!(job.id(), config.source_path.as_path());
    }

    #[test]
    fn test_move_into_place_overwrites() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("x.mp4");
        let artifact = dir.path().join("x-1.mkv");
        fs::write(&original, b"old").unwrap();
        fs::write(&artifact, b"new").unwrap();

        move_into_place(&artifact, &original).expect("move succeeds");

        assert_eq!(fs::read(&original).unwrap(), b"new");
        assert!(!artifact.exists());
    }

    // Passes jobs through unchanged, counting invocations.
    struct CountingAction {
        starts: AtomicUsize,
        kills: AtomicUsize,
    }

    impl CountingAction {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                kills: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Action for Arc<CountingAction> {
        async fn start(&self, job: Job) -> Result<Job, ActionError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(job)
        }

        async fn kill(&self, _job_id: &Path) -> Result<(), ActionError> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // Rewrites the current source to a fresh intermediate with `content`.
    struct RewritingAction {
        content: &'static [u8],
        extension: &'static str,
    }

    #[async_trait]
    impl Action for RewritingAction {
        async fn start(&self, mut job: Job) -> Result<Job, ActionError> {
            let dest = job.next_destination(Some(self.extension));
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, self.content)?;
            job.current_source = dest;
            Ok(job)
        }

        async fn kill(&self, _job_id: &Path) -> Result<(), ActionError> {
            Ok(())
        }
    }

    // Fails every start.
    struct FailingAction;

    #[async_trait]
    impl Action for FailingAction {
        async fn start(&self, _job: Job) -> Result<Job, ActionError> {
            Err(ActionError::Execution("encoder exploded".to_string()))
        }

        async fn kill(&self, _job_id: &Path) -> Result<(), ActionError> {
            Ok(())
        }
    }

    // Parks until killed, then settles with the killed error.
    struct ParkedAction {
        killed: tokio::sync::Notify,
        kills: AtomicUsize,
    }

    impl ParkedAction {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                killed: tokio::sync::Notify::new(),
                kills: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Action for Arc<ParkedAction> {
        async fn start(&self, _job: Job) -> Result<Job, ActionError> {
            self.killed.notified().await;
            Err(ActionError::Killed)
        }

        async fn kill(&self, _job_id: &Path) -> Result<(), ActionError> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.killed.notify_waiters();
            Ok(())
        }
    }

    fn instance(name: &str, worker: Box<dyn Action>) -> Arc<ActionInstance> {
        Arc::new(ActionInstance::new(
            name.to_string(),
            PluginIdentifier::parse("compressarr-test").unwrap(),
            name.to_string(),
            worker,
        ))
    }

    struct Fixture {
        bus: Arc<EventBus>,
        scheduler: Arc<JobScheduler>,
        runner: Arc<JobRunner>,
        published: Arc<Mutex<Vec<PathBuf>>>,
        _dir: TempDir,
        lib: PathBuf,
    }

    fn fixture(instances: usize, actions: Vec<Arc<ActionInstance>>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let lib = dir.path().join("lib");
        fs::create_dir_all(&lib).unwrap();
        let job_root = dir.path().join("jobs");

        let bus = Arc::new(EventBus::new());
        let scheduler = JobScheduler::new(bus.clone(), instances, job_root);
        scheduler.attach();
        let runner = JobRunner::new(bus.clone(), scheduler.clone(), actions);
        runner.attach();

        let published = Arc::new(Mutex::new(Vec::new()));
        let p = published.clone();
        bus.subscribe(EventKind::PublishJob, move |event| {
            if let Event::PublishJob { source } = event {
                p.lock().unwrap().push(source.clone());
            }
        });

        Fixture {
            bus,
            scheduler,
            runner,
            published,
            _dir: dir,
            lib,
        }
    }

    fn drop_file(fx: &Fixture, name: &str) -> PathBuf {
        let path = fx.lib.join(name);
        fs::write(&path, b"source media").unwrap();
        fx.bus.publish(Event::RegisterMedia(MediaRef {
            library_root: fx.lib.clone(),
            relative_path: PathBuf::from(name),
        }));
        path
    }

    #[tokio::test]
    async fn test_happy_path_pass_through_action() {
        let action = CountingAction::new();
        let fx = fixture(1, vec![instance("dummy", Box::new(action.clone()))]);

        let source = drop_file(&fx, "x.mp4");
        fx.runner.wait_idle().await;

        assert_eq!(action.starts.load(Ordering::SeqCst), 1);
        assert_eq!(fx.published.lock().unwrap().as_slice(), &[source.clone()]);
        assert_eq!(fx.scheduler.active_count(), 0);
        assert_eq!(fx.scheduler.pending_count(), 0);
        // Source untouched: the action never rewrote it.
        assert_eq!(fs::read(&source).unwrap(), b"source media");
    }

    #[tokio::test]
    async fn test_two_step_pipeline_moves_artifact_into_place() {
        let fx = fixture(
            1,
            vec![
                instance(
                    "transcode",
                    Box::new(RewritingAction {
                        content: b"transcoded",
                        extension: "mkv",
                    }),
                ),
                instance("tag", Box::new(CountingAction::new().clone())),
            ],
        );

        let source = drop_file(&fx, "x.mp4");
        fx.runner.wait_idle().await;

        assert_eq!(fx.published.lock().unwrap().as_slice(), &[source.clone()]);
        // The artifact replaced the original in place.
        assert_eq!(fs::read(&source).unwrap(), b"transcoded");
        // The intermediate is gone.
        assert!(!fx._dir.path().join("jobs/x-1.mkv").exists());
    }

    #[tokio::test]
    async fn test_failed_action_abandons_without_publish() {
        let fx = fixture(1, vec![instance("broken", Box::new(FailingAction))]);

        drop_file(&fx, "x.mp4");
        fx.runner.wait_idle().await;

        assert!(fx.published.lock().unwrap().is_empty());
        assert_eq!(fx.scheduler.active_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_releases_slot_for_next_job() {
        let fx = fixture(1, vec![instance("broken", Box::new(FailingAction))]);

        drop_file(&fx, "a.mp4");
        drop_file(&fx, "b.mp4");
        fx.runner.wait_idle().await;

        // Both jobs ran (and failed); neither published, tables empty.
        assert!(fx.published.lock().unwrap().is_empty());
        assert_eq!(fx.scheduler.active_count(), 0);
        assert_eq!(fx.scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_kills_owning_action() {
        let action = ParkedAction::new();
        let fx = fixture(1, vec![instance("parked", Box::new(action.clone()))]);

        drop_file(&fx, "y.mp4");
        // Let the job task enter the action.
        tokio::task::yield_now().await;

        fx.bus.publish(Event::UnregisterMedia(MediaRef {
            library_root: fx.lib.clone(),
            relative_path: PathBuf::from("y.mp4"),
        }));
        fx.runner.wait_idle().await;

        assert_eq!(action.kills.load(Ordering::SeqCst), 1);
        assert!(fx.published.lock().unwrap().is_empty());
        assert_eq!(fx.scheduler.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_before_first_step_prevents_start() {
        let action = CountingAction::new();
        let fx = fixture(1, vec![instance("dummy", Box::new(action.clone()))]);

        // Publish both events before the spawned task gets polled: the
        // unregister must win at the first boundary check.
        drop_file(&fx, "x.mp4");
        fx.bus.publish(Event::UnregisterMedia(MediaRef {
            library_root: fx.lib.clone(),
            relative_path: PathBuf::from("x.mp4"),
        }));
        fx.runner.wait_idle().await;

        assert_eq!(action.starts.load(Ordering::SeqCst), 0);
        assert!(fx.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_for_unknown_source_is_noop() {
        let action = CountingAction::new();
        let fx = fixture(1, vec![instance("dummy", Box::new(action.clone()))]);

        fx.bus.publish(Event::UnregisterJob {
            source: fx.lib.join("never-registered.mp4"),
        });
        fx.runner.wait_idle().await;

        assert_eq!(action.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_update_during_run_requeues_fresh_job() {
        let parked = ParkedAction::new();
        let fx = fixture(1, vec![instance("parked", Box::new(parked.clone()))]);

        let source = drop_file(&fx, "y.mp4");
        tokio::task::yield_now().await;

        // The file changed mid-run: old admission cancelled, path requeued
        // and re-admitted.
        fx.bus.publish(Event::UpdateMedia(MediaRef {
            library_root: fx.lib.clone(),
            relative_path: PathBuf::from("y.mp4"),
        }));

        // First task settles via kill, second parks again; kill it to end
        // the test.
        tokio::task::yield_now().await;
        assert!(fx.scheduler.is_active(&source));
        fx.bus.publish(Event::UnregisterMedia(MediaRef {
            library_root: fx.lib.clone(),
            relative_path: PathBuf::from("y.mp4"),
        }));
        fx.runner.wait_idle().await;

        assert!(fx.published.lock().unwrap().is_empty());
        assert!(parked.kills.load(Ordering::SeqCst) >= 1);
    }
}

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use super::executor::{ExecError, Launcher, RsyncProcess};
use super::task_log::{list_exec_logs, TaskLog};
use super::{RsyncTask, TaskState};
use crate::storage::{StorageError, TaskStore};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to start rsync for task {id}: {source}")]
    Start {
        id: String,
        #[source]
        source: ExecError,
    },

    #[error("rsync failed for task {id}: {source}")]
    Run {
        id: String,
        #[source]
        source: ExecError,
    },

    #[error("failed to stop rsync for task {id}: {source}")]
    Stop {
        id: String,
        #[source]
        source: ExecError,
    },

    #[error("queue full")]
    QueueFull,

    #[error("cannot retry running task {0}")]
    RetryRunning(String),

    #[error("task {0} is marked running but has no live process")]
    SupervisionLost(String),

    #[error("task manager is shutting down")]
    ShuttingDown,

    #[error("task log error for {id}: {source}")]
    Log {
        id: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub max_concurrency: usize,
    pub queue_size: usize,
    pub log_root: PathBuf,
}

/// Processes the manager supervises, guarded by one lock.
#[derive(Default)]
struct Live {
    /// Tasks with a registered rsync process.
    running: HashMap<String, Arc<RsyncProcess>>,
    /// Tasks claimed by a worker whose process is still being started.
    starting: HashSet<String>,
}

/// Owns the task lifecycle: a bounded FIFO of task ids, a semaphore capping
/// concurrent transfers, and the map of live processes.
///
/// `state == running` holds exactly while a process is registered for the
/// task. Every transition that touches the map happens under `live` and
/// persists before the lock is released. A task is claimed in `starting`
/// before its process is launched, so at most one worker ever starts it.
#[derive(Clone)]
pub struct RsyncManager {
    store: Arc<dyn TaskStore>,
    launcher: Arc<dyn Launcher>,
    log_root: Arc<PathBuf>,
    live: Arc<Mutex<Live>>,
    queue: mpsc::Sender<String>,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl RsyncManager {
    /// Create the manager and spawn its dispatcher on the current runtime.
    pub fn new(store: Arc<dyn TaskStore>, launcher: Arc<dyn Launcher>, options: ManagerOptions) -> Self {
        let max_concurrency = options.max_concurrency.max(1);
        let (queue, queue_rx) = mpsc::channel(options.queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = Self {
            store,
            launcher,
            log_root: Arc::new(options.log_root),
            live: Arc::new(Mutex::new(Live::default())),
            queue,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            shutdown_tx: Arc::new(shutdown_tx),
        };

        tokio::spawn(manager.clone().dispatch(queue_rx, shutdown_rx));
        info!(
            "Rsync task manager started (max concurrency {}, queue size {})",
            max_concurrency,
            options.queue_size.max(1)
        );
        manager
    }

    async fn dispatch(self, mut queue: mpsc::Receiver<String>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let id = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                id = queue.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let manager = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                // run in its own task so a panic is contained to this transfer
                let worker = tokio::spawn(manager.clone().run_task(id.clone()));
                match worker.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Task {} finished with error: {}", id, e),
                    Err(join_err) => {
                        error!("Worker for task {} panicked: {}", id, join_err);
                        manager.recover_panicked(&id).await;
                    }
                }
            });
        }
        debug!("Dispatcher stopped");
    }

    /// Stop dispatching and wait for every in-flight transfer to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down rsync task manager");
        self.shutdown_tx.send_replace(true);
        match self.semaphore.acquire_many(self.max_concurrency as u32).await {
            Ok(_all) => self.semaphore.close(),
            Err(_) => debug!("Task manager already shut down"),
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Persist a new pending task and optionally queue it. Returns the new id.
    pub fn create_task(&self, mut task: RsyncTask, enqueue: bool) -> Result<String> {
        let now = Utc::now();
        task.id = uuid::Uuid::new_v4().to_string();
        task.created_at = now;
        task.updated_at = now;
        task.state = TaskState::Pending;
        task.attempt = 0;
        task.last_error.clear();

        self.store.create_task(&mut task).map_err(|e| {
            error!("Failed to save task {}: {}", task.id, e);
            e
        })?;
        info!("Created rsync task {} ({})", task.id, task.name);

        if enqueue {
            self.enqueue_task(&task.id).map_err(|e| {
                error!("Failed to enqueue task {}: {}", task.id, e);
                e
            })?;
        }
        Ok(task.id)
    }

    /// Queue an existing task without waiting; a full queue is an error.
    pub fn enqueue_task(&self, id: &str) -> Result<()> {
        self.store.get_task(id)?;
        if self.is_shutting_down() {
            return Err(ManagerError::ShuttingDown);
        }
        self.queue.try_send(id.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ManagerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ManagerError::ShuttingDown,
        })?;
        debug!("Queued task {}", id);
        Ok(())
    }

    pub fn list_tasks(&self, page: usize, page_size: usize) -> Result<Vec<RsyncTask>> {
        Ok(self.store.list_tasks(page, page_size)?)
    }

    pub fn all_tasks(&self) -> Result<Vec<RsyncTask>> {
        Ok(self.store.all_tasks()?)
    }

    pub fn get_task(&self, id: &str) -> Result<RsyncTask> {
        Ok(self.store.get_task(id)?)
    }

    pub fn find_task_by_name(&self, name: &str) -> Result<RsyncTask> {
        Ok(self.store.get_task_by_name(name)?)
    }

    pub async fn stop_task(&self, id: &str) -> Result<()> {
        let process = {
            let mut live = self.live.lock();
            let mut task = self.store.get_task(id)?;
            let Some(process) = live.running.remove(id) else {
                if task.is_running() {
                    error!("Task {} is marked running but no process is registered", id);
                    return Err(ManagerError::SupervisionLost(id.to_string()));
                }
                task.state = TaskState::Stopped;
                self.store.save_task(&mut task)?;
                info!("Task {} marked stopped", id);
                return Ok(());
            };

            task.state = TaskState::Stopped;
            if let Err(e) = self.store.save_task(&mut task) {
                live.running.insert(id.to_string(), process);
                return Err(e.into());
            }
            process
        };

        info!("Stopping rsync for task {}", id);
        process.stop().await.map_err(|source| {
            error!("Failed to stop rsync for task {}: {}", id, source);
            ManagerError::Stop {
                id: id.to_string(),
                source,
            }
        })
    }

    pub fn retry_task(&self, id: &str) -> Result<()> {
        {
            let _live = self.live.lock();
            let mut task = self.store.get_task(id)?;
            if task.is_running() {
                error!("Cannot retry running task {}", id);
                return Err(ManagerError::RetryRunning(id.to_string()));
            }
            task.state = TaskState::Pending;
            task.attempt += 1;
            self.store.save_task(&mut task).map_err(|e| {
                error!("Failed to save task {}: {}", id, e);
                e
            })?;
            info!("Retrying task {} (attempt {})", id, task.attempt);
        }
        self.enqueue_task(id)
    }

    /// Remove a task, stopping its process first if one is live.
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let process = {
            let mut live = self.live.lock();
            self.store.get_task(id)?;
            let process = live.running.remove(id);
            if let Err(e) = self.store.delete_task(id) {
                if let Some(process) = process {
                    live.running.insert(id.to_string(), process);
                }
                return Err(e.into());
            }
            process
        };

        if let Some(process) = process {
            if let Err(e) = process.stop().await {
                warn!("Failed to stop rsync for deleted task {}: {}", id, e);
            }
        }
        info!("Deleted task {}", id);
        Ok(())
    }

    /// Dry-run a task and return the path of its test log.
    pub async fn test_sync(&self, id: &str) -> Result<PathBuf> {
        let task = self.store.get_task(id)?;
        let log = self.open_log(id)?;

        if let Err(e) = self.launcher.dry_run(&task, &log).await {
            info!("Test sync failed for task {}: {}", id, e);
            log.append_test(&format!("Error: {e}")).map_err(|source| ManagerError::Log {
                id: id.to_string(),
                source,
            })?;
        }

        let path = log.test_path().ok_or_else(|| ManagerError::Log {
            id: id.to_string(),
            source: io::Error::other("test log was not created"),
        })?;
        info!("Test sync for task {} logged to {}", id, path.display());
        Ok(path)
    }

    /// Execution log files of a task: `(total, page)`.
    pub fn task_logs(&self, id: &str, page: usize, page_size: usize) -> Result<(usize, Vec<PathBuf>)> {
        list_exec_logs(&self.log_root, id, page, page_size).map_err(|source| ManagerError::Log {
            id: id.to_string(),
            source,
        })
    }

    fn open_log(&self, id: &str) -> Result<TaskLog> {
        TaskLog::new(&self.log_root, id).map_err(|source| ManagerError::Log {
            id: id.to_string(),
            source,
        })
    }

    async fn run_task(self, id: String) -> Result<()> {
        let Some(task) = self.claim(&id)? else {
            return Ok(());
        };

        let log = match self.open_log(&id) {
            Ok(log) => log,
            Err(e) => {
                self.fail_pending(&id, &e.to_string())?;
                return Err(e);
            }
        };
        let process = match self.launcher.start(&task, &log).await {
            Ok(process) => Arc::new(process),
            Err(source) => {
                self.fail_pending(&id, &source.to_string())?;
                if let Err(e) = log.append_exec(&format!("Error: {source}")) {
                    warn!("Failed to append execution log for task {}: {}", id, e);
                }
                return Err(ManagerError::Start { id, source });
            }
        };

        match self.register(&id, &process) {
            Ok(true) => {}
            Ok(false) => {
                info!("Task {} changed while rsync was starting, stopping it", id);
                if let Err(e) = process.stop().await {
                    warn!("Failed to stop rsync for task {}: {}", id, e);
                }
                return Ok(());
            }
            Err(e) => {
                error!("Failed to save running state for task {}: {}", id, e);
                if let Err(stop_err) = process.stop().await {
                    warn!("Failed to stop rsync for task {}: {}", id, stop_err);
                }
                if let Err(fail_err) = self.fail_pending(&id, &e.to_string()) {
                    warn!("Failed to mark task {} failed: {}", id, fail_err);
                }
                if let Err(log_err) = log.append_exec(&format!("Error: {e}")) {
                    warn!("Failed to append execution log for task {}: {}", id, log_err);
                }
                return Err(e);
            }
        }

        let outcome = process.wait().await;
        self.complete(&id, &process, &outcome)?;

        match outcome {
            Ok(()) => Ok(()),
            Err(source) => {
                if !process.was_stopped() {
                    if let Err(e) = log.append_exec(&format!("Error: {source}")) {
                        warn!("Failed to append execution log for task {}: {}", id, e);
                    }
                }
                Err(ManagerError::Run { id, source })
            }
        }
    }

    /// Reserve a pending task for this worker. `None` when the task was
    /// deleted, is no longer pending, or another worker already holds it.
    fn claim(&self, id: &str) -> Result<Option<RsyncTask>> {
        let mut live = self.live.lock();
        let task = match self.store.get_task(id) {
            Ok(task) => task,
            Err(StorageError::NotFound(_)) => {
                debug!("Task {} was deleted before it ran", id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if task.state != TaskState::Pending {
            debug!("Skipping task {} in state {}", id, task.state);
            return Ok(None);
        }
        if live.running.contains_key(id) || !live.starting.insert(id.to_string()) {
            debug!("Task {} is already being started", id);
            return Ok(None);
        }
        Ok(Some(task))
    }

    /// Persist `running` and register the handle as one step, releasing the
    /// claim. `Ok(false)` means the task was stopped or deleted after it was
    /// claimed.
    fn register(&self, id: &str, process: &Arc<RsyncProcess>) -> Result<bool> {
        let mut live = self.live.lock();
        live.starting.remove(id);
        let mut task = match self.store.get_task(id) {
            Ok(task) => task,
            Err(StorageError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if task.state != TaskState::Pending || live.running.contains_key(id) {
            return Ok(false);
        }

        task.state = TaskState::Running;
        self.store.save_task(&mut task)?;
        live.running.insert(id.to_string(), process.clone());
        Ok(true)
    }

    /// Record the exit of a registered process and deregister it. Leaves the
    /// task alone if stop or delete already took the handle.
    fn complete(&self, id: &str, process: &Arc<RsyncProcess>, outcome: &std::result::Result<(), ExecError>) -> Result<()> {
        let mut live = self.live.lock();
        let ours = live.running.get(id).is_some_and(|p| Arc::ptr_eq(p, process));
        if !ours {
            debug!("Task {} was stopped or deleted while running", id);
            return Ok(());
        }

        let mut task = match self.store.get_task(id) {
            Ok(task) => task,
            Err(e) => {
                live.running.remove(id);
                return Err(e.into());
            }
        };
        match outcome {
            Ok(()) => {
                task.state = TaskState::Succeeded;
                task.last_error.clear();
                info!("rsync completed successfully for task {}", id);
            }
            Err(e) => {
                task.state = TaskState::Failed;
                task.last_error = e.to_string();
                error!("rsync failed for task {}: {}", id, e);
            }
        }

        // On failure the handle stays registered so the record still has a
        // live handle; a later stop can settle it.
        if let Err(e) = self.store.save_task(&mut task) {
            error!("Failed to save final state for task {}: {}", id, e);
            return Err(e.into());
        }
        live.running.remove(id);
        Ok(())
    }

    /// Release the claim on `id` and mark it failed if it is still pending.
    fn fail_pending(&self, id: &str, message: &str) -> Result<()> {
        let mut live = self.live.lock();
        live.starting.remove(id);
        let mut task = self.store.get_task(id)?;
        if task.state != TaskState::Pending {
            return Ok(());
        }
        task.state = TaskState::Failed;
        task.last_error = message.to_string();
        self.store.save_task(&mut task).map_err(|e| {
            error!("Failed to save failed state for task {}: {}", id, e);
            e
        })?;
        Ok(())
    }

    async fn recover_panicked(&self, id: &str) {
        let process = {
            let mut live = self.live.lock();
            live.starting.remove(id);
            let process = live.running.remove(id);
            match self.store.get_task(id) {
                Ok(mut task) if matches!(task.state, TaskState::Pending | TaskState::Running) => {
                    task.state = TaskState::Failed;
                    task.last_error = "worker panicked".to_string();
                    if let Err(e) = self.store.save_task(&mut task) {
                        error!("Failed to save failed state for task {}: {}", id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Could not load task {} after worker panic: {}", id, e),
            }
            process
        };
        if let Some(process) = process {
            if let Err(e) = process.stop().await {
                warn!("Failed to stop rsync for task {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsync::{AuthMode, RemoteType, SyncDirection};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::process::Command;

    /// Runs `sh -c <local_path>` in place of rsync, after `start_delay`.
    #[derive(Default)]
    struct ScriptLauncher {
        start_delay: Duration,
        starts: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptLauncher {
        fn slow(start_delay: Duration) -> Self {
            Self {
                start_delay,
                ..Self::default()
            }
        }
    }

    /// Memory store whose saves of `running` can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_running: AtomicBool,
    }

    impl TaskStore for FlakyStore {
        fn create_task(&self, task: &mut RsyncTask) -> crate::storage::Result<()> {
            self.inner.create_task(task)
        }

        fn save_task(&self, task: &mut RsyncTask) -> crate::storage::Result<()> {
            if task.is_running() && self.fail_running.load(Ordering::SeqCst) {
                return Err(StorageError::Io {
                    path: PathBuf::from("rsync_tasks.json"),
                    source: io::Error::other("disk full"),
                });
            }
            self.inner.save_task(task)
        }

        fn get_task(&self, id: &str) -> crate::storage::Result<RsyncTask> {
            self.inner.get_task(id)
        }

        fn get_task_by_name(&self, name: &str) -> crate::storage::Result<RsyncTask> {
            self.inner.get_task_by_name(name)
        }

        fn list_tasks(&self, page: usize, page_size: usize) -> crate::storage::Result<Vec<RsyncTask>> {
            self.inner.list_tasks(page, page_size)
        }

        fn all_tasks(&self) -> crate::storage::Result<Vec<RsyncTask>> {
            self.inner.all_tasks()
        }

        fn delete_task(&self, id: &str) -> crate::storage::Result<()> {
            self.inner.delete_task(id)
        }

        fn close(&self) -> crate::storage::Result<()> {
            self.inner.close()
        }
    }

    #[async_trait]
    impl Launcher for ScriptLauncher {
        async fn start(&self, task: &RsyncTask, log: &TaskLog) -> std::result::Result<RsyncProcess, ExecError> {
            if task.local_path == "panic" {
                panic!("launcher blew up");
            }
            tokio::time::sleep(self.start_delay).await;
            self.starts.lock().push((task.id.clone(), Instant::now()));
            let out = log.exec_writer().map_err(ExecError::Log)?;
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&task.local_path).stdout(out);
            RsyncProcess::spawn(cmd, Duration::from_millis(50)).map_err(ExecError::Spawn)
        }

        async fn dry_run(&self, task: &RsyncTask, log: &TaskLog) -> std::result::Result<(), ExecError> {
            let mut out = log.test_writer().map_err(ExecError::Log)?;
            writeln!(out, "would sync {}", task.name).map_err(ExecError::Log)?;
            if task.local_path.starts_with("exit 1") {
                return Err(ExecError::NoProcess);
            }
            Ok(())
        }
    }

    struct Fixture {
        manager: RsyncManager,
        store: Arc<FlakyStore>,
        launcher: Arc<ScriptLauncher>,
        _logs: TempDir,
    }

    fn fixture(max_concurrency: usize, queue_size: usize) -> Fixture {
        fixture_with(max_concurrency, queue_size, ScriptLauncher::default())
    }

    fn fixture_with(max_concurrency: usize, queue_size: usize, launcher: ScriptLauncher) -> Fixture {
        let logs = TempDir::new().unwrap();
        let store = Arc::new(FlakyStore::default());
        let launcher = Arc::new(launcher);
        let manager = RsyncManager::new(
            store.clone(),
            launcher.clone(),
            ManagerOptions {
                max_concurrency,
                queue_size,
                log_root: logs.path().to_path_buf(),
            },
        );
        Fixture {
            manager,
            store,
            launcher,
            _logs: logs,
        }
    }

    fn script_task(name: &str, script: &str) -> RsyncTask {
        let mut t = RsyncTask::new(name, SyncDirection::LocalToRemote, RemoteType::Ssh, AuthMode::PrivateKey);
        t.local_path = script.to_string();
        t
    }

    async fn wait_for_state(manager: &RsyncManager, id: &str, state: TaskState) -> RsyncTask {
        for _ in 0..400 {
            let task = manager.get_task(id).unwrap();
            if task.state == state {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {id} never reached {state}, is {}", manager.get_task(id).unwrap().state);
    }

    fn assert_running_iff_registered(manager: &RsyncManager) {
        let live = manager.live.lock();
        for task in manager.all_tasks().unwrap() {
            assert_eq!(task.is_running(), live.running.contains_key(&task.id), "task {} in {}", task.id, task.state);
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let fx = fixture(1, 10);
        let id = fx.manager.create_task(script_task("ok", "exit 0"), true).unwrap();

        let task = wait_for_state(&fx.manager, &id, TaskState::Succeeded).await;
        assert_eq!(task.attempt, 0);
        assert!(task.last_error.is_empty());
        assert_running_iff_registered(&fx.manager);
    }

    #[tokio::test]
    async fn test_failed_run_records_error() {
        let fx = fixture(1, 10);
        let id = fx.manager.create_task(script_task("bad", "exit 3"), true).unwrap();

        let task = wait_for_state(&fx.manager, &id, TaskState::Failed).await;
        assert!(task.last_error.contains('3'), "{}", task.last_error);
        assert_running_iff_registered(&fx.manager);

        let (total, logs) = fx.manager.task_logs(&id, 1, 10).unwrap();
        assert_eq!(total, 1);
        let content = std::fs::read_to_string(&logs[0]).unwrap();
        assert!(content.contains("Error: rsync exited with"));
    }

    #[tokio::test]
    async fn test_tasks_run_one_at_a_time() {
        let fx = fixture(1, 10);
        let a = fx.manager.create_task(script_task("a", "sleep 0.3"), true).unwrap();
        let b = fx.manager.create_task(script_task("b", "sleep 0.3"), true).unwrap();

        wait_for_state(&fx.manager, &a, TaskState::Succeeded).await;
        wait_for_state(&fx.manager, &b, TaskState::Succeeded).await;

        let starts = fx.launcher.starts.lock().clone();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[0].0, a);
        assert!(starts[1].1.duration_since(starts[0].1) >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let fx = fixture(1, 1);
        let running = fx.manager.create_task(script_task("running", "sleep 30"), true).unwrap();
        wait_for_state(&fx.manager, &running, TaskState::Running).await;

        // picked up by the dispatcher, waiting for a slot
        fx.manager.create_task(script_task("waiting", "exit 0"), true).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // fills the one queue slot
        fx.manager.create_task(script_task("queued", "exit 0"), true).unwrap();

        let overflow = fx.manager.create_task(script_task("overflow", "exit 0"), false).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), async { fx.manager.enqueue_task(&overflow) })
            .await
            .unwrap();
        assert!(matches!(result, Err(ManagerError::QueueFull)));

        fx.manager.stop_task(&running).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_running_task() {
        let fx = fixture(1, 10);
        let id = fx.manager.create_task(script_task("long", "sleep 30"), true).unwrap();
        wait_for_state(&fx.manager, &id, TaskState::Running).await;

        let started = Instant::now();
        fx.manager.stop_task(&id).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fx.manager.get_task(&id).unwrap().state, TaskState::Stopped);
        assert_running_iff_registered(&fx.manager);

        // the worker's completion must not overwrite the stop
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fx.manager.get_task(&id).unwrap().state, TaskState::Stopped);

        // a second stop finds no process and nothing running
        fx.manager.stop_task(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_pending_task() {
        let fx = fixture(1, 10);
        let id = fx.manager.create_task(script_task("idle", "exit 0"), false).unwrap();

        fx.manager.stop_task(&id).await.unwrap();
        assert_eq!(fx.manager.get_task(&id).unwrap().state, TaskState::Stopped);
    }

    #[tokio::test]
    async fn test_stopped_while_queued_is_skipped() {
        let fx = fixture(1, 10);
        let first = fx.manager.create_task(script_task("first", "sleep 30"), true).unwrap();
        wait_for_state(&fx.manager, &first, TaskState::Running).await;
        let second = fx.manager.create_task(script_task("second", "exit 0"), true).unwrap();

        fx.manager.stop_task(&second).await.unwrap();
        fx.manager.stop_task(&first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(fx.manager.get_task(&second).unwrap().state, TaskState::Stopped);
        assert_eq!(fx.launcher.starts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_without_handle_reports_lost_supervision() {
        let fx = fixture(1, 10);
        let mut task = script_task("orphan", "exit 0");
        task.id = "orphan".to_string();
        task.state = TaskState::Running;
        fx.store.save_task(&mut task).unwrap();

        let err = fx.manager.stop_task("orphan").await.unwrap_err();
        assert!(matches!(err, ManagerError::SupervisionLost(_)));
    }

    #[tokio::test]
    async fn test_retry() {
        let fx = fixture(1, 10);
        let id = fx.manager.create_task(script_task("flaky", "exit 1"), true).unwrap();
        wait_for_state(&fx.manager, &id, TaskState::Failed).await;

        fx.manager.retry_task(&id).unwrap();
        let task = fx.manager.get_task(&id).unwrap();
        assert_eq!(task.attempt, 1);

        let task = wait_for_state(&fx.manager, &id, TaskState::Failed).await;
        assert_eq!(task.attempt, 1);
        assert_eq!(fx.launcher.starts.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_running_is_rejected() {
        let fx = fixture(1, 10);
        let id = fx.manager.create_task(script_task("long", "sleep 30"), true).unwrap();
        wait_for_state(&fx.manager, &id, TaskState::Running).await;

        let err = fx.manager.retry_task(&id).unwrap_err();
        assert!(matches!(err, ManagerError::RetryRunning(_)));
        assert_eq!(fx.manager.get_task(&id).unwrap().attempt, 0);

        fx.manager.stop_task(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_running_task() {
        let fx = fixture(1, 10);
        let id = fx.manager.create_task(script_task("long", "sleep 30"), true).unwrap();
        wait_for_state(&fx.manager, &id, TaskState::Running).await;

        fx.manager.delete_task(&id).await.unwrap();
        assert!(fx.manager.live.lock().running.is_empty());
        assert!(matches!(
            fx.manager.get_task(&id),
            Err(ManagerError::Storage(StorageError::NotFound(_)))
        ));
        assert!(matches!(
            fx.manager.delete_task(&id).await,
            Err(ManagerError::Storage(StorageError::NotFound(_)))
        ));
    }

    /// Script that leaves `marker` behind only if it runs to the end.
    fn marker_script(marker: &std::path::Path) -> String {
        format!("sleep 1 && touch '{}'", marker.display())
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_starts_one_process() {
        let fx = fixture_with(2, 10, ScriptLauncher::slow(Duration::from_millis(200)));
        let id = fx.manager.create_task(script_task("dup", "sleep 0.3"), true).unwrap();
        // retrying a pending task queues its id a second time
        fx.manager.retry_task(&id).unwrap();

        let task = wait_for_state(&fx.manager, &id, TaskState::Succeeded).await;
        assert_eq!(task.attempt, 1);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(fx.launcher.starts.lock().len(), 1);
        assert_eq!(fx.manager.task_logs(&id, 1, 10).unwrap().0, 1);
        assert!(fx.manager.live.lock().starting.is_empty());
    }

    #[tokio::test]
    async fn test_stop_while_starting_kills_fresh_process() {
        let scratch = TempDir::new().unwrap();
        let marker = scratch.path().join("finished");
        let fx = fixture_with(1, 10, ScriptLauncher::slow(Duration::from_millis(300)));
        let id = fx.manager.create_task(script_task("slow-start", &marker_script(&marker)), true).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.manager.live.lock().starting.contains(&id));
        fx.manager.stop_task(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(fx.manager.get_task(&id).unwrap().state, TaskState::Stopped);
        assert_eq!(fx.launcher.starts.lock().len(), 1);
        assert_running_iff_registered(&fx.manager);
        assert!(fx.manager.live.lock().starting.is_empty());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_delete_while_starting_kills_fresh_process() {
        let scratch = TempDir::new().unwrap();
        let marker = scratch.path().join("finished");
        let fx = fixture_with(1, 10, ScriptLauncher::slow(Duration::from_millis(300)));
        let id = fx.manager.create_task(script_task("slow-start", &marker_script(&marker)), true).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.manager.delete_task(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(matches!(
            fx.manager.get_task(&id),
            Err(ManagerError::Storage(StorageError::NotFound(_)))
        ));
        let live = fx.manager.live.lock();
        assert!(live.running.is_empty() && live.starting.is_empty());
        drop(live);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_failed_running_save_kills_process() {
        let scratch = TempDir::new().unwrap();
        let marker = scratch.path().join("finished");
        let fx = fixture(1, 10);
        fx.store.fail_running.store(true, Ordering::SeqCst);

        let id = fx.manager.create_task(script_task("no-disk", &marker_script(&marker)), true).unwrap();
        let task = wait_for_state(&fx.manager, &id, TaskState::Failed).await;
        assert!(task.last_error.contains("disk full"), "{}", task.last_error);
        assert_running_iff_registered(&fx.manager);
        assert!(fx.manager.live.lock().running.is_empty());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let fx = fixture(1, 10);
        fx.manager.create_task(script_task("same", "exit 0"), false).unwrap();
        let err = fx.manager.create_task(script_task("same", "exit 0"), false).unwrap_err();
        assert!(matches!(err, ManagerError::Storage(StorageError::NameExists(_))));
    }

    #[tokio::test]
    async fn test_worker_panic_fails_only_that_task() {
        let fx = fixture(1, 10);
        let bad = fx.manager.create_task(script_task("bad", "panic"), true).unwrap();
        let task = wait_for_state(&fx.manager, &bad, TaskState::Failed).await;
        assert_eq!(task.last_error, "worker panicked");

        let good = fx.manager.create_task(script_task("good", "exit 0"), true).unwrap();
        wait_for_state(&fx.manager, &good, TaskState::Succeeded).await;
    }

    #[tokio::test]
    async fn test_test_sync_writes_test_log() {
        let fx = fixture(1, 10);
        let ok = fx.manager.create_task(script_task("dry", "exit 0"), false).unwrap();
        let path = fx.manager.test_sync(&ok).await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("test-"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("would sync dry"));

        let bad = fx.manager.create_task(script_task("dry-bad", "exit 1"), false).unwrap();
        let path = fx.manager.test_sync(&bad).await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("Error: no process"));

        // dry runs never show up as execution logs
        assert_eq!(fx.manager.task_logs(&ok, 1, 10).unwrap().0, 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_tasks() {
        let fx = fixture(2, 10);
        let id = fx.manager.create_task(script_task("short", "sleep 0.3"), true).unwrap();
        wait_for_state(&fx.manager, &id, TaskState::Running).await;

        fx.manager.shutdown().await;
        assert_eq!(fx.manager.get_task(&id).unwrap().state, TaskState::Succeeded);
        assert!(matches!(fx.manager.enqueue_task(&id), Err(ManagerError::ShuttingDown)));
    }
}

//! Tracks named background tasks and drains them on shutdown.
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long [`TaskManager::shutdown`] waits before aborting stragglers.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A centralized registry for spawned tasks.
///
/// Every task observes the shared shutdown signal through
/// [`TaskManager::get_shutdown_rx`]; [`TaskManager::shutdown`] then waits for
/// all of them, aborting whatever is still running after the grace period.
#[derive(Clone, Debug)]
pub struct TaskManager {
    handles: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
    shutdown_rx: watch::Receiver<bool>,
    grace: Duration,
}

impl TaskManager {
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_rx,
            grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Spawns a task and registers it under `name`.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task_name = name, "Spawning task");
        let handle = tokio::spawn(future);
        self.lock_handles().push((name, handle));
    }

    /// Returns a clone of the shutdown receiver.
    pub fn get_shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Number of tasks registered and not yet drained.
    pub fn task_count(&self) -> usize {
        self.lock_handles().len()
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<(&'static str, JoinHandle<()>)>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Waits for all managed tasks to complete, aborting any that outlive
    /// the grace period.
    pub async fn shutdown(self) {
        let handles = self.lock_handles().drain(..).collect::<Vec<_>>();
        info!(tasks = handles.len(), "TaskManager shutting down, waiting for tasks to complete");

        let (task_names, handles): (Vec<&'static str>, Vec<JoinHandle<()>>) = handles.into_iter().unzip();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let results = match tokio::time::timeout(self.grace, join_all(handles)).await {
            Ok(results) => results,
            Err(_) => {
                warn!(grace = ?self.grace, "Tasks did not finish in time, aborting the rest");
                for (name, abort) in task_names.iter().zip(&abort_handles) {
                    if !abort.is_finished() {
                        warn!(task_name = name, "Aborting task");
                        abort.abort();
                    }
                }
                return;
            }
        };

        let mut panicked = Vec::new();
        for (task_name, result) in task_names.into_iter().zip(results) {
            match result {
                Ok(()) => debug!(task_name, "Task shut down gracefully."),
                Err(e) if e.is_panic() => {
                    error!(task_name, "Task panicked during shutdown.");
                    panicked.push(task_name);
                }
                Err(_) => debug!(task_name, "Task was cancelled."),
            }
        }

        if panicked.is_empty() {
            info!("All tasks shut down gracefully.");
        } else {
            error!(tasks = ?panicked, "{} tasks panicked during shutdown", panicked.len());
        }
    }
}

//! Atomically swappable reference data with optional hot reload.

use super::ReferenceData;
use crate::{internal_metrics::Metrics, task_manager::TaskManager};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use notify::{event::EventKind, Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Shared handle to the current reference snapshot.
///
/// Readers call [`ReferenceStore::snapshot`] once per operation and keep the
/// returned `Arc` for its duration, so a reload never changes data under an
/// in-flight evaluation.
#[derive(Clone)]
pub struct ReferenceStore {
    current: Arc<ArcSwap<ReferenceData>>,
    fingerprint: Arc<Mutex<Option<blake3::Hash>>>,
}

impl ReferenceStore {
    pub fn new(data: ReferenceData) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(data)),
            fingerprint: Arc::new(Mutex::new(None)),
        }
    }

    /// Loads the initial snapshot from a YAML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read reference data: {}", path.display()))?;
        let data = ReferenceData::from_yaml_str(&content)
            .with_context(|| format!("Invalid reference data in {}", path.display()))?;
        let store = Self::new(data);
        store.remember(blake3::hash(content.as_bytes()));
        Ok(store)
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<ReferenceData> {
        self.current.load_full()
    }

    /// Replaces the snapshot wholesale.
    pub fn replace(&self, data: ReferenceData) {
        self.current.store(Arc::new(data));
    }

    fn remember(&self, hash: blake3::Hash) -> bool {
        let mut guard = match self.fingerprint.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.as_ref() == Some(&hash) {
            return false;
        }
        *guard = Some(hash);
        true
    }

    /// Re-reads `path` and swaps in the new snapshot if it changed and is
    /// valid. An invalid file leaves the previous snapshot in place.
    ///
    /// # Returns
    /// * `Ok(true)` if a new snapshot was installed
    /// * `Ok(false)` if the content was unchanged
    /// * `Err` if the file could not be read or failed validation
    pub async fn reload_from(&self, path: &Path) -> Result<bool> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read reference data: {}", path.display()))?;
        let hash = blake3::hash(content.as_bytes());
        {
            let guard = match self.fingerprint.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.as_ref() == Some(&hash) {
                return Ok(false);
            }
        }
        let data = ReferenceData::from_yaml_str(&content)
            .with_context(|| format!("Invalid reference data in {}", path.display()))?;
        self.replace(data);
        self.remember(hash);
        Ok(true)
    }

    /// Watches `path` and reloads the snapshot whenever it changes, until the
    /// task manager signals shutdown.
    pub fn watch(
        &self,
        path: PathBuf,
        task_manager: &TaskManager,
        metrics: Arc<Metrics>,
        reload_notifier: Option<mpsc::Sender<()>>,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Event>(100);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if let Err(e) = tx.blocking_send(event) {
                        warn!("Failed to forward reference file event: {}", e);
                    }
                }
            },
            Config::default(),
        )?;
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(parent, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "Watching reference data for changes");

        let store = self.clone();
        let mut shutdown_rx = task_manager.get_shutdown_rx();
        task_manager.spawn("ReferenceWatcher", async move {
            // Dropping the watcher stops event delivery, so it lives in the task.
            let _watcher = watcher;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        info!("Reference watcher received shutdown signal.");
                        break;
                    }
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        if !Self::is_relevant(&event, &path) {
                            continue;
                        }
                        match store.reload_from(&path).await {
                            Ok(true) => {
                                let (substances, jurisdictions, thresholds) = store.snapshot().counts();
                                metrics.increment_reference_reload("success");
                                info!(substances, jurisdictions, thresholds, "Reference data reloaded");
                                if let Some(notifier) = &reload_notifier {
                                    if notifier.send(()).await.is_err() {
                                        warn!("Reload notifier channel closed");
                                    }
                                }
                            }
                            Ok(false) => {}
                            Err(e) => {
                                metrics.increment_reference_reload("rejected");
                                error!(error = %e, "Reference data reload rejected, keeping previous snapshot");
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn is_relevant(event: &Event, path: &Path) -> bool {
        match event.kind {
            EventKind::Modify(_) | EventKind::Create(_) => event
                .paths
                .iter()
                .any(|p| p == path || p.file_name() == path.file_name()),
            _ => false,
        }
    }
}

//! Model lifecycle — download, verify, delete and activate models.
//!
//! The manager is the only writer of the catalog. It also owns the
//! "at most one active model" rule: the session loads whatever it is given,
//! and the manager marks the matching catalog entry afterwards.

use super::catalog::{ModelCatalog, ModelStatePatch, ModelStatus};
use super::registry::{builtin_descriptors, ModelDescriptor};
use super::transfer::{partial_path, verify_sha256, Fetcher, HttpFetcher, Transfer, TransferRequest};
use crate::config::AppConfig;
use crate::error::{CatalogError, LifecycleError, SessionError, TransferError};
use crate::llm::{InferenceBackend, InferenceSession};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

type TransferMap = Mutex<HashMap<String, Arc<Notify>>>;

pub struct ModelLifecycleManager<B: InferenceBackend, F: Fetcher = HttpFetcher> {
    catalog: Arc<ModelCatalog>,
    session: Arc<InferenceSession<B>>,
    fetcher: F,
    models_dir: PathBuf,
    transfers: TransferMap,
}

impl<B: InferenceBackend> ModelLifecycleManager<B, HttpFetcher> {
    /// Wire the built-in catalog, an HTTP fetcher and a fresh session from
    /// `config`, then reconcile against what is already on disk.
    pub fn from_config(config: &AppConfig, backend: B) -> Result<Self, TransferError> {
        let catalog = Arc::new(ModelCatalog::new(builtin_descriptors()));
        let session = Arc::new(InferenceSession::new(backend, config.context.clone()));
        let fetcher = HttpFetcher::new(config.download.clone())?;
        let manager = Self::new(catalog, session, fetcher, config.models_dir.clone());
        manager.reconcile();
        Ok(manager)
    }
}

impl<B: InferenceBackend, F: Fetcher> ModelLifecycleManager<B, F> {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        session: Arc<InferenceSession<B>>,
        fetcher: F,
        models_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            session,
            fetcher,
            models_dir: models_dir.into(),
            transfers: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn session(&self) -> &Arc<InferenceSession<B>> {
        &self.session
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Full path for a model's file.
    pub fn model_path(&self, id: &str) -> Result<PathBuf, LifecycleError> {
        let descriptor = self.catalog.descriptor(id)?;
        Ok(self.path_for(&descriptor))
    }

    /// Probe the filesystem for a model's file.
    pub fn is_downloaded(&self, id: &str) -> Result<bool, LifecycleError> {
        Ok(file_present(&self.model_path(id)?))
    }

    /// IDs of every model the catalog currently considers downloaded.
    pub fn downloaded_model_ids(&self) -> Vec<String> {
        self.catalog
            .list()
            .into_iter()
            .filter(|(_, state)| state.status == ModelStatus::Downloaded)
            .map(|(descriptor, _)| descriptor.id)
            .collect()
    }

    /// Mark every model whose file is on disk as downloaded.
    ///
    /// Download state is not persisted, so this is how a restart learns what
    /// is already there. Returns the ids that changed.
    pub fn reconcile(&self) -> Vec<String> {
        let mut upgraded = Vec::new();
        for (descriptor, state) in self.catalog.list() {
            if state.status == ModelStatus::Downloading {
                continue;
            }
            if !file_present(&self.path_for(&descriptor)) {
                continue;
            }
            let result = self.catalog.transition(&descriptor.id, |current| {
                if current.status == ModelStatus::Downloading {
                    Ok::<_, CatalogError>(ModelStatePatch::default())
                } else {
                    Ok(ModelStatePatch::status(ModelStatus::Downloaded).with_progress(1.0))
                }
            });
            if result.is_ok() && state.status != ModelStatus::Downloaded {
                log::info!("[MODEL] Found {} on disk", descriptor.id);
                upgraded.push(descriptor.id);
            }
        }
        upgraded
    }

    /// Download a model and wait for the transfer to finish.
    ///
    /// Progress is visible through the catalog while this runs. On any
    /// failure the model goes back to `NotDownloaded` and the partial file is
    /// removed; a later call starts from zero.
    pub async fn start_download(&self, id: &str) -> Result<PathBuf, LifecycleError> {
        let descriptor = self.catalog.descriptor(id)?;
        self.catalog.transition(id, |state| match state.status {
            ModelStatus::Downloading => Err(LifecycleError::AlreadyInProgress(id.to_string())),
            ModelStatus::Downloaded => Err(LifecycleError::AlreadyDownloaded(id.to_string())),
            ModelStatus::NotDownloaded => {
                Ok(ModelStatePatch::status(ModelStatus::Downloading).with_progress(0.0))
            }
        })?;

        let destination = self.path_for(&descriptor);
        let mut pending = PendingDownload {
            catalog: &self.catalog,
            id,
            destination: &destination,
            armed: true,
        };
        // Dropped before `pending`, so a retry never sees a stale cancel signal.
        let cancel = Arc::new(Notify::new());
        let _registration = TransferRegistration::register(&self.transfers, id, Arc::clone(&cancel));

        log::info!(
            "[MODEL] Downloading {} ({}) to {}",
            descriptor.id,
            descriptor.size,
            destination.display()
        );

        let result = self.run_transfer(&descriptor, &destination, &cancel).await;
        pending.armed = false;
        match result {
            Ok(path) => {
                self.catalog.update(
                    id,
                    ModelStatePatch::status(ModelStatus::Downloaded).with_progress(1.0),
                )?;
                log::info!("[MODEL] Download complete: {}", path.display());
                Ok(path)
            }
            Err(source) => {
                log::error!("[MODEL] Download of {} failed: {}", id, source);
                discard_partial(&destination);
                self.catalog.update(
                    id,
                    ModelStatePatch::status(ModelStatus::NotDownloaded).with_progress(0.0),
                )?;
                Err(LifecycleError::DownloadFailed {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }

    /// Ask the in-flight download of `id` to stop. Returns false when there
    /// is none. The download resolves as failed through the usual path.
    pub fn cancel_download(&self, id: &str) -> bool {
        match lock(&self.transfers).get(id) {
            Some(cancel) => {
                log::info!("[MODEL] Cancelling download of {}", id);
                cancel.notify_one();
                true
            }
            None => false,
        }
    }

    /// Delete a downloaded model's file and reset its state.
    ///
    /// Does not unload the session, even if this was the active model.
    pub fn delete(&self, id: &str) -> Result<(), LifecycleError> {
        let descriptor = self.catalog.descriptor(id)?;
        if self.catalog.get(id)?.status != ModelStatus::Downloaded {
            return Err(LifecycleError::NotDownloaded(id.to_string()));
        }

        let path = self.path_for(&descriptor);
        match std::fs::remove_file(&path) {
            Ok(()) => log::info!("[MODEL] Deleted: {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("[MODEL] {} was already gone", path.display());
            }
            Err(source) => {
                log::error!("[MODEL] Failed to delete {}: {}", path.display(), source);
                return Err(LifecycleError::DeletionFailed {
                    id: id.to_string(),
                    source,
                });
            }
        }
        discard_partial(&path);

        self.catalog.update(
            id,
            ModelStatePatch::status(ModelStatus::NotDownloaded)
                .with_progress(0.0)
                .with_active(false),
        )?;
        Ok(())
    }

    /// Load a downloaded model into the session and make it the only active one.
    pub async fn set_active(&self, id: &str) -> Result<(), LifecycleError> {
        let descriptor = self.catalog.descriptor(id)?;
        if self.catalog.get(id)?.status != ModelStatus::Downloaded {
            return Err(LifecycleError::NotDownloaded(id.to_string()));
        }

        let path = self.path_for(&descriptor);
        if !path.is_file() {
            log::warn!("[MODEL] {} is marked downloaded but {} is missing", id, path.display());
            return Err(LifecycleError::MissingFile {
                id: id.to_string(),
                path,
            });
        }

        if let Err(e) = self.session.load(&path).await {
            // Any other failure happened after the previous model was released.
            if !matches!(e, SessionError::LoadInProgress) {
                self.catalog.clear_active();
            }
            return Err(e.into());
        }

        let state = self.catalog.set_exclusive_active(id)?;
        if !state.is_active {
            // Deleted while the load ran; the session holds a model the catalog no longer has.
            log::warn!("[MODEL] {} was deleted while loading", id);
            return Err(LifecycleError::NotDownloaded(id.to_string()));
        }
        log::info!("[MODEL] Active model: {}", id);
        Ok(())
    }

    /// Unload the session and clear the active flag.
    pub async fn deactivate(&self) {
        self.session.unload().await;
        self.catalog.clear_active();
    }

    fn path_for(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.models_dir.join(&descriptor.local_file_name)
    }

    async fn run_transfer(
        &self,
        descriptor: &ModelDescriptor,
        destination: &Path,
        cancel: &Notify,
    ) -> Result<PathBuf, TransferError> {
        std::fs::create_dir_all(&self.models_dir)?;

        let (transfer, mut progress_rx) = Transfer::new(TransferRequest {
            model_id: descriptor.id.clone(),
            url: descriptor.source_url.clone(),
            destination: destination.to_path_buf(),
        });

        let run = async {
            tokio::select! {
                result = transfer.run(&self.fetcher) => result,
                _ = cancel.notified() => Err(TransferError::Cancelled),
            }
        };
        // Ends when the transfer drops its sender, so every report lands
        // before the terminal transition below.
        let forward = async {
            while let Some(progress) = progress_rx.recv().await {
                self.record_progress(&descriptor.id, progress.fraction());
            }
        };
        let (result, ()) = tokio::join!(run, forward);
        let path = result?;

        if let Some(expected) = descriptor.sha256.clone() {
            let check_path = path.clone();
            let verified = tokio::task::spawn_blocking(move || verify_sha256(&check_path, &expected))
                .await
                .map_err(|e| TransferError::Io(std::io::Error::other(e.to_string())))
                .and_then(|r| r);
            if let Err(e) = verified {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
            log::info!("[MODEL] Verified SHA-256 of {}", descriptor.id);
        }
        Ok(path)
    }

    fn record_progress(&self, id: &str, fraction: f64) {
        let _ = self.catalog.transition(id, |state| {
            if state.status == ModelStatus::Downloading {
                Ok::<_, CatalogError>(ModelStatePatch::progress(fraction))
            } else {
                Ok(ModelStatePatch::default())
            }
        });
    }
}

/// Keeps the cancel signal for one download reachable; removed on drop.
struct TransferRegistration<'a> {
    transfers: &'a TransferMap,
    id: String,
}

impl<'a> TransferRegistration<'a> {
    fn register(transfers: &'a TransferMap, id: &str, cancel: Arc<Notify>) -> Self {
        lock(transfers).insert(id.to_string(), cancel);
        Self {
            transfers,
            id: id.to_string(),
        }
    }
}

impl Drop for TransferRegistration<'_> {
    fn drop(&mut self) {
        lock(self.transfers).remove(&self.id);
    }
}

/// Reverts a download to `NotDownloaded` if its future is dropped before it
/// settles, so a later `start_download` can run.
struct PendingDownload<'a> {
    catalog: &'a ModelCatalog,
    id: &'a str,
    destination: &'a Path,
    armed: bool,
}

impl Drop for PendingDownload<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::warn!("[MODEL] Download of {} abandoned before completion", self.id);
        discard_partial(self.destination);
        let _ = self.catalog.update(
            self.id,
            ModelStatePatch::status(ModelStatus::NotDownloaded).with_progress(0.0),
        );
    }
}

fn lock(transfers: &TransferMap) -> MutexGuard<'_, HashMap<String, Arc<Notify>>> {
    transfers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A model counts as present when its file exists and is not empty.
fn file_present(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn discard_partial(destination: &Path) {
    let partial = partial_path(destination);
    if partial.exists() {
        if let Err(e) = std::fs::remove_file(&partial) {
            log::warn!("[MODEL] Could not remove {}: {}", partial.display(), e);
        }
    }
}

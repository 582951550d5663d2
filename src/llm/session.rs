//! Inference session — one loaded model, one generation at a time.
//!
//! The loaded model is held as an `Arc<LoadedModel>`; dropping the last
//! reference releases the native handle, so replacing the slot is enough to
//! free the previous model. Native load and generation run inside
//! `spawn_blocking` so callers stay responsive.

use super::backend::{BackendError, CompletionRequest, ContextParams, InferenceBackend, TokenFlow};
use super::stop::StopScanner;
use crate::chat::{Message, Transcript, TranscriptMutator, GENERATION_ERROR_MARKER};
use crate::error::SessionError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, watch};

/// Fragments buffered between the engine thread and the transcript.
const TOKEN_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Unloaded,
    Loading,
    Loaded,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationSummary {
    pub tokens_predicted: u32,
    /// Marker that ended the reply, if the stream was cut by one.
    pub stop_marker: Option<String>,
}

#[derive(Debug)]
pub enum GenerationOutcome {
    /// Not loaded, or another generation is running. Nothing was touched.
    Skipped,
    Completed(GenerationSummary),
    /// The engine failed; the error marker was appended to the transcript.
    Failed(SessionError),
}

impl GenerationOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, GenerationOutcome::Skipped)
    }
}

/// Owned native handle. Dropping it releases the model.
struct LoadedModel<B: InferenceBackend> {
    backend: Arc<B>,
    handle: Option<B::Handle>,
    path: PathBuf,
}

impl<B: InferenceBackend> LoadedModel<B> {
    fn complete(
        &self,
        request: &CompletionRequest,
        on_token: &mut dyn FnMut(&str) -> TokenFlow,
    ) -> Result<super::backend::Completion, BackendError> {
        match &self.handle {
            Some(handle) => self.backend.complete(handle, request, on_token),
            None => Err(BackendError("model handle already released".to_string())),
        }
    }
}

impl<B: InferenceBackend> Drop for LoadedModel<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.backend.release(handle);
            log::info!("[SESSION] Released {}", self.path.display());
        }
    }
}

struct Slot<B: InferenceBackend> {
    status: SessionStatus,
    model: Option<Arc<LoadedModel<B>>>,
}

pub struct InferenceSession<B: InferenceBackend> {
    backend: Arc<B>,
    params: ContextParams,
    slot: Mutex<Slot<B>>,
    load_gate: tokio::sync::Mutex<()>,
    generating: Arc<AtomicBool>,
    status_tx: watch::Sender<SessionStatus>,
}

impl<B: InferenceBackend> InferenceSession<B> {
    pub fn new(backend: B, params: ContextParams) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Unloaded);
        Self {
            backend: Arc::new(backend),
            params,
            slot: Mutex::new(Slot {
                status: SessionStatus::Unloaded,
                model: None,
            }),
            load_gate: tokio::sync::Mutex::new(()),
            generating: Arc::new(AtomicBool::new(false)),
            status_tx,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn status(&self) -> SessionStatus {
        self.slot().status
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::Acquire)
    }

    /// Path of the model currently held, if any.
    pub fn loaded_path(&self) -> Option<PathBuf> {
        self.slot().model.as_ref().map(|m| m.path.clone())
    }

    /// Observe status transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Load a model file, releasing whatever was loaded before.
    ///
    /// A second call while a load is running is rejected with
    /// [`SessionError::LoadInProgress`].
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let path = path.as_ref().to_path_buf();
        let _gate = self.load_gate.try_lock().map_err(|_| {
            log::warn!("[SESSION] Rejected load of {}: load in progress", path.display());
            SessionError::LoadInProgress
        })?;

        let previous = self.set_state(SessionStatus::Loading, None);
        let mut pending = PendingLoad {
            session: self,
            armed: true,
        };
        release(previous).await;

        log::info!("[SESSION] Loading {}", path.display());
        let start = Instant::now();
        let backend = Arc::clone(&self.backend);
        let params = self.params.clone();
        let load_path = path.clone();

        let result = tokio::task::spawn_blocking(move || {
            let handle = backend.load(&load_path, &params)?;
            Ok::<_, BackendError>(LoadedModel {
                backend,
                handle: Some(handle),
                path: load_path,
            })
        })
        .await;

        pending.armed = false;
        let model = match result {
            Ok(Ok(model)) => model,
            Ok(Err(e)) => return Err(self.fail_load(path, e.to_string())),
            Err(e) => return Err(self.fail_load(path, format!("load task failed: {e}"))),
        };

        self.set_state(SessionStatus::Loaded, Some(Arc::new(model)));
        log::info!(
            "[SESSION] Model loaded: {} in {}ms",
            path.display(),
            start.elapsed().as_millis()
        );
        Ok(())
    }

    /// Release the loaded model. No-op when nothing is held.
    ///
    /// Waits for an in-flight load to settle first.
    pub async fn unload(&self) {
        let _gate = self.load_gate.lock().await;
        let previous = {
            let mut slot = self.slot();
            let model = slot.model.take();
            if model.is_some() {
                slot.status = SessionStatus::Unloaded;
            }
            model
        };
        if previous.is_none() {
            return;
        }
        self.status_tx.send_replace(SessionStatus::Unloaded);
        release(previous).await;
        log::info!("[SESSION] Model unloaded");
    }

    /// Stream a reply to `messages` into the last message of `transcript`.
    ///
    /// Returns [`GenerationOutcome::Skipped`] without touching anything unless a
    /// model is loaded and no other generation is running.
    pub async fn generate<T>(&self, messages: &[Message], transcript: &mut T) -> GenerationOutcome
    where
        T: TranscriptMutator + ?Sized,
    {
        let Some(model) = self.loaded_model() else {
            log::debug!("[SESSION] Generate skipped: no model loaded");
            return GenerationOutcome::Skipped;
        };
        let Some(flag) = GeneratingFlag::acquire(&self.generating) else {
            log::debug!("[SESSION] Generate skipped: already generating");
            return GenerationOutcome::Skipped;
        };

        let request = CompletionRequest::from_messages(messages);
        let (tx, mut rx) = mpsc::channel::<String>(TOKEN_CHANNEL_CAPACITY);
        let start = Instant::now();
        log::info!("[SESSION] Generating reply to {} messages", messages.len());

        // The flag travels with the engine call, so dropping this future
        // does not let a second generation start on the same handle.
        let task = tokio::task::spawn_blocking(move || {
            let _flag = flag;
            run_completion(&model, &request, tx)
        });

        while let Some(fragment) = rx.recv().await {
            transcript.append_to_last(&fragment);
        }

        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(BackendError(format!("generation task failed: {e}"))),
        };

        match result {
            Ok(summary) => {
                log::info!(
                    "[SESSION] Generated {} tokens in {}ms (stop: {:?})",
                    summary.tokens_predicted,
                    start.elapsed().as_millis(),
                    summary.stop_marker
                );
                GenerationOutcome::Completed(summary)
            }
            Err(e) => {
                log::error!("[SESSION] Generation failed: {}", e);
                transcript.append_to_last(GENERATION_ERROR_MARKER);
                GenerationOutcome::Failed(SessionError::GenerationFailed(e.0))
            }
        }
    }

    /// Add a user turn plus an assistant placeholder and stream the reply into it.
    ///
    /// Unlike [`generate`](Self::generate) this refuses with
    /// [`SessionError::NotReady`] instead of skipping silently.
    pub async fn send_message(
        &self,
        transcript: &mut Transcript,
        text: impl Into<String>,
    ) -> Result<GenerationOutcome, SessionError> {
        if self.status() != SessionStatus::Loaded || self.is_generating() {
            return Err(SessionError::NotReady);
        }
        let history = transcript.begin_exchange(text);
        Ok(self.generate(&history, transcript).await)
    }

    fn loaded_model(&self) -> Option<Arc<LoadedModel<B>>> {
        let slot = self.slot();
        match slot.status {
            SessionStatus::Loaded => slot.model.clone(),
            _ => None,
        }
    }

    fn fail_load(&self, path: PathBuf, reason: String) -> SessionError {
        log::error!("[SESSION] Failed to load {}: {}", path.display(), reason);
        self.set_state(SessionStatus::Error, None);
        SessionError::LoadFailed { path, reason }
    }

    /// Swap status and model together; returns the model that was held.
    fn set_state(
        &self,
        status: SessionStatus,
        model: Option<Arc<LoadedModel<B>>>,
    ) -> Option<Arc<LoadedModel<B>>> {
        let previous = {
            let mut slot = self.slot();
            slot.status = status;
            std::mem::replace(&mut slot.model, model)
        };
        self.status_tx.send_replace(status);
        previous
    }

    fn slot(&self) -> MutexGuard<'_, Slot<B>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop the session's reference on the blocking pool. If a generation still
/// holds the model, the native release happens when that generation ends.
async fn release<B: InferenceBackend>(model: Option<Arc<LoadedModel<B>>>) {
    if let Some(model) = model {
        if let Err(e) = tokio::task::spawn_blocking(move || drop(model)).await {
            log::error!("[SESSION] Release task failed: {}", e);
        }
    }
}

/// Runs on the blocking pool. Fragments pass through the stop scanner before
/// they reach the channel.
fn run_completion<B: InferenceBackend>(
    model: &LoadedModel<B>,
    request: &CompletionRequest,
    tx: mpsc::Sender<String>,
) -> Result<GenerationSummary, BackendError> {
    let mut scanner = StopScanner::new(&request.stop_sequences);
    let result = model.complete(request, &mut |fragment: &str| {
        let step = scanner.push(fragment);
        if !step.emit.is_empty() && tx.blocking_send(step.emit).is_err() {
            return TokenFlow::Stop;
        }
        if step.stopped {
            TokenFlow::Stop
        } else {
            TokenFlow::Continue
        }
    });

    let tail = scanner.finish();
    if !tail.is_empty() {
        let _ = tx.blocking_send(tail);
    }

    let completion = result?;
    Ok(GenerationSummary {
        tokens_predicted: completion.tokens_predicted,
        stop_marker: scanner.matched().map(str::to_string),
    })
}

/// Holds `is_generating` high until the engine call it belongs to returns.
struct GeneratingFlag(Arc<AtomicBool>);

impl GeneratingFlag {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for GeneratingFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Moves the session to `Error` if a load future is dropped before it settles.
struct PendingLoad<'a, B: InferenceBackend> {
    session: &'a InferenceSession<B>,
    armed: bool,
}

impl<B: InferenceBackend> Drop for PendingLoad<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("[SESSION] Load abandoned before completion");
            self.session.set_state(SessionStatus::Error, None);
        }
    }
}

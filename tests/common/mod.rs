//! Shared fakes for the integration tests: an in-process inference backend
//! and a fetcher that writes a fixed body in chunks.

#![allow(dead_code)]

use gufftalk_lib::error::TransferError;
use gufftalk_lib::llm::{
    BackendError, Completion, CompletionRequest, ContextParams, InferenceBackend, TokenFlow,
};
use gufftalk_lib::models::transfer::partial_path;
use gufftalk_lib::models::{
    Fetcher, ModelCatalog, ModelDescriptor, ModelLifecycleManager, TransferProgress,
    TransferRequest,
};
use gufftalk_lib::InferenceSession;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ── Backend ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeState {
    pub alive: Mutex<Vec<PathBuf>>,
    pub released: Mutex<Vec<PathBuf>>,
    pub script: Mutex<Vec<String>>,
    pub last_request: Mutex<Option<CompletionRequest>>,
    pub fail_load: AtomicBool,
    pub fail_generation: AtomicBool,
    pub stopped_early: AtomicBool,
    pub load_delay_ms: AtomicU64,
    pub token_delay_ms: AtomicU64,
    pub loads: AtomicUsize,
}

impl FakeState {
    pub fn set_script(&self, tokens: &[&str]) {
        *self.script.lock().unwrap() = tokens.iter().map(|t| t.to_string()).collect();
    }

    pub fn alive(&self) -> Vec<PathBuf> {
        self.alive.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<PathBuf> {
        self.released.lock().unwrap().clone()
    }
}

pub struct FakeHandle {
    path: PathBuf,
}

pub struct FakeBackend {
    state: Arc<FakeState>,
}

impl FakeBackend {
    pub fn new() -> (Self, Arc<FakeState>) {
        let state = Arc::new(FakeState::default());
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl InferenceBackend for FakeBackend {
    type Handle = FakeHandle;

    fn load(&self, path: &Path, _params: &ContextParams) -> Result<FakeHandle, BackendError> {
        let delay = self.state.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_load.load(Ordering::SeqCst) {
            return Err(BackendError("not a gguf file".to_string()));
        }
        self.state.alive.lock().unwrap().push(path.to_path_buf());
        Ok(FakeHandle {
            path: path.to_path_buf(),
        })
    }

    fn release(&self, handle: FakeHandle) {
        let mut alive = self.state.alive.lock().unwrap();
        if let Some(pos) = alive.iter().position(|p| *p == handle.path) {
            alive.remove(pos);
        }
        self.state.released.lock().unwrap().push(handle.path);
    }

    fn complete(
        &self,
        _handle: &FakeHandle,
        request: &CompletionRequest,
        on_token: &mut dyn FnMut(&str) -> TokenFlow,
    ) -> Result<Completion, BackendError> {
        *self.state.last_request.lock().unwrap() = Some(request.clone());
        let script = self.state.script.lock().unwrap().clone();
        let delay = self.state.token_delay_ms.load(Ordering::SeqCst);

        let mut n = 0;
        for token in &script {
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay));
            }
            n += 1;
            if on_token(token) == TokenFlow::Stop {
                self.state.stopped_early.store(true, Ordering::SeqCst);
                break;
            }
        }

        if self.state.fail_generation.load(Ordering::SeqCst) {
            return Err(BackendError("engine crashed".to_string()));
        }
        Ok(Completion {
            tokens_predicted: n,
        })
    }
}

pub fn session() -> (InferenceSession<FakeBackend>, Arc<FakeState>) {
    init_logging();
    let (backend, state) = FakeBackend::new();
    (InferenceSession::new(backend, ContextParams::default()), state)
}

// ── Fetcher ─────────────────────────────────────────────────────────

pub struct FakeFetcher {
    pub body: Vec<u8>,
    pub chunk_size: usize,
    /// Fail with HTTP 500 before writing this chunk index.
    pub fail_at_chunk: Mutex<Option<usize>>,
    /// When set, the fetch waits for a notification before writing.
    pub gate: Option<Arc<Notify>>,
    /// Never finish once this chunk index is reached; the partial file stays.
    pub stall_at_chunk: Option<usize>,
    pub calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new(body_len: usize, chunk_size: usize) -> Self {
        Self {
            body: (0..body_len).map(|i| (i % 251) as u8).collect(),
            chunk_size,
            fail_at_chunk: Mutex::new(None),
            gate: None,
            stall_at_chunk: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_at(self, chunk: usize) -> Self {
        *self.fail_at_chunk.lock().unwrap() = Some(chunk);
        self
    }

    pub fn stalling_at(mut self, chunk: usize) -> Self {
        self.stall_at_chunk = Some(chunk);
        self
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        request: &TransferRequest,
        progress: mpsc::Sender<TransferProgress>,
    ) -> Result<u64, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let fail_at = *self.fail_at_chunk.lock().unwrap();
        let partial = partial_path(&request.destination);
        let mut file = std::fs::File::create(&partial)?;
        let total = self.body.len() as u64;
        let mut written = 0u64;

        for (idx, chunk) in self.body.chunks(self.chunk_size).enumerate() {
            if fail_at == Some(idx) {
                return Err(TransferError::Status(500));
            }
            if self.stall_at_chunk == Some(idx) {
                file.flush()?;
                std::future::pending::<()>().await;
            }
            file.write_all(chunk)?;
            written += chunk.len() as u64;
            let _ = progress
                .send(TransferProgress {
                    bytes_written: written,
                    bytes_expected: total,
                })
                .await;
            tokio::task::yield_now().await;
        }

        drop(file);
        std::fs::rename(&partial, &request.destination)?;
        Ok(written)
    }
}

// ── Manager ─────────────────────────────────────────────────────────

pub fn descriptor(id: &str) -> ModelDescriptor {
    ModelDescriptor::new(
        id,
        format!("Model {id}"),
        "1 KB",
        format!("https://models.test/{id}.gguf"),
        format!("{id}.gguf"),
    )
}

pub type TestManager = ModelLifecycleManager<FakeBackend, FakeFetcher>;

pub fn manager_with(
    models_dir: &Path,
    descriptors: Vec<ModelDescriptor>,
    fetcher: FakeFetcher,
) -> (Arc<TestManager>, Arc<FakeState>) {
    init_logging();
    let (backend, state) = FakeBackend::new();
    let catalog = Arc::new(ModelCatalog::new(descriptors));
    let session = Arc::new(InferenceSession::new(backend, ContextParams::default()));
    let manager = ModelLifecycleManager::new(catalog, session, fetcher, models_dir);
    (Arc::new(manager), state)
}

pub fn manager(models_dir: &Path, fetcher: FakeFetcher) -> (Arc<TestManager>, Arc<FakeState>) {
    manager_with(
        models_dir,
        vec![descriptor("m1"), descriptor("m2")],
        fetcher,
    )
}

//! GuffTalk core — on-device model management and chat inference.
//!
//! This crate wires together:
//! - Model catalog, downloads and activation (models/)
//! - The single-model inference session and stop markers (llm/)
//! - The conversation transcript generation streams into (chat/)
//!
//! A UI drives it through command/query methods on
//! [`ModelLifecycleManager`] and [`InferenceSession`] and observes changes
//! through [`ModelCatalog::subscribe`] and [`InferenceSession::subscribe`].

pub mod chat;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;

pub use chat::{Message, Role, Transcript, TranscriptMutator};
pub use config::{AppConfig, DownloadConfig};
pub use error::{CatalogError, ConfigError, LifecycleError, SessionError, TransferError};
pub use llm::{
    ContextParams, GenerationOutcome, InferenceBackend, InferenceSession, SessionStatus,
    STOP_MARKERS,
};
pub use models::{
    ModelCatalog, ModelDescriptor, ModelLifecycleManager, ModelState, ModelStatus,
};

/// Initialise `env_logger` from `RUST_LOG`. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

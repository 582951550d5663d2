//! Inference domain — the native backend seam, stop markers and the
//! single-model session.

pub mod backend;
#[cfg(feature = "local-llm")]
pub mod llama;
pub mod prompt;
pub mod session;
pub mod stop;

pub use backend::{
    BackendError, ChatMessage, Completion, CompletionRequest, ContextParams, InferenceBackend,
    TokenFlow,
};
pub use session::{GenerationOutcome, GenerationSummary, InferenceSession, SessionStatus};
pub use stop::{StopScanner, STOP_MARKERS};

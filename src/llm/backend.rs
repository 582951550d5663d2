//! The native inference boundary.
//!
//! A backend turns a model file into a handle and runs completions against
//! it. All three calls are blocking; the session drives them from
//! `spawn_blocking`.

use crate::chat::{Message, Role};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Fixed context parameters used for every load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextParams {
    pub context_size: u32,
    pub gpu_layers: u32,
    pub use_mlock: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            context_size: 2048,
            gpu_layers: 99,
            use_mlock: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub stop_sequences: Vec<String>,
    /// `None` means generate until a stop condition.
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// Flatten a transcript slice into role/content pairs with the default
    /// stop set and no token cap.
    pub fn from_messages(messages: &[Message]) -> Self {
        Self {
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role,
                    content: m.text.clone(),
                })
                .collect(),
            stop_sequences: super::stop::STOP_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_tokens: None,
        }
    }
}

/// Returned by the token callback to keep going or end the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFlow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub tokens_predicted: u32,
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

pub trait InferenceBackend: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    fn load(&self, path: &Path, params: &ContextParams) -> Result<Self::Handle, BackendError>;

    fn release(&self, handle: Self::Handle);

    /// Run a completion, calling `on_token` for every decoded fragment in
    /// order. Must return promptly after `on_token` answers [`TokenFlow::Stop`].
    fn complete(
        &self,
        handle: &Self::Handle,
        request: &CompletionRequest,
        on_token: &mut dyn FnMut(&str) -> TokenFlow,
    ) -> Result<Completion, BackendError>;
}

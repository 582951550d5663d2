//! Conversation domain — public API.
//!
//! The transcript is owned by whoever renders it. The inference session only
//! touches it through [`TranscriptMutator`].

mod transcript;

pub use transcript::{Message, Role, Transcript, TranscriptMutator, GENERATION_ERROR_MARKER};

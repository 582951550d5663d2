use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Appended to the reply when the engine fails mid-generation.
pub const GENERATION_ERROR_MARKER: &str = "\n\n[Error generating response]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "bot")]
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One chat message. `text` grows while a reply streams in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

/// Write access a generation gets over the conversation.
pub trait TranscriptMutator: Send {
    /// Append a fragment to the text of the last message.
    fn append_to_last(&mut self, fragment: &str);

    /// Append a whole message.
    fn push(&mut self, message: Message);
}

/// Ordered in-memory conversation history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a conversation with an assistant greeting.
    pub fn with_greeting(text: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::assistant(text)],
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Record a user turn plus an empty assistant placeholder for the reply.
    ///
    /// Returns the history to send to the model, which excludes the placeholder.
    pub fn begin_exchange(&mut self, text: impl Into<String>) -> Vec<Message> {
        self.messages.push(Message::user(text));
        let history = self.messages.clone();
        self.messages.push(Message::assistant(""));
        history
    }
}

impl TranscriptMutator for Transcript {
    fn append_to_last(&mut self, fragment: &str) {
        match self.messages.last_mut() {
            Some(last) => last.text.push_str(fragment),
            None => log::warn!("[CHAT] Dropped fragment: transcript is empty"),
        }
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

impl From<Vec<Message>> for Transcript {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

//! The core models for managing a stateful chat with an LLM.
use std::fmt;

use serde::{Deserialize, Serialize};

/// The assistant message every transcript starts with.
pub const DEFAULT_GREETING: &str = "How may I assist you today?";

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful assistant.
You do not respond as "User" or pretend to be "User".
You only respond once as "Assistant"."#;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
}

impl Role {
    /// Capitalized label used when serializing a transcript into a
    /// prompt.
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Message {
    role: Role,
    content: String,
}

impl Message {
    pub fn new(role: Role, content: &str) -> Self {
        Message {
            role,
            content: content.to_string(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Ordered, append-only chat history. Always starts with the assistant
/// greeting and only shrinks through `clear`.
#[derive(Clone, Debug, PartialEq)]
pub struct Transcript(Vec<Message>);

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        Self(vec![Message::new(Role::Assistant, DEFAULT_GREETING)])
    }

    /// Raw fixture for tests that need a transcript without the greeting.
    #[cfg(test)]
    pub(crate) fn new_with_messages(messages: Vec<Message>) -> Self {
        Self(messages)
    }

    /// Seeded transcript followed by `messages`.
    pub fn with_history(messages: Vec<Message>) -> Self {
        let mut transcript = Self::new();
        transcript.0.extend(messages);
        transcript
    }

    pub fn messages(&self) -> &[Message] {
        &self.0
    }

    pub fn push(&mut self, msg: Message) {
        self.0.push(msg)
    }

    pub fn last(&self) -> Option<&Message> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.0.iter()
    }

    /// Reset back to the seeded greeting.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Whether a user message is waiting on an assistant response.
    pub fn awaiting_response(&self) -> bool {
        matches!(self.last(), Some(m) if m.role() == Role::User)
    }
}

/// The steering instruction prepended to every request. Kept apart from
/// the transcript and never stored as a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemPrompt(String);

impl Default for SystemPrompt {
    fn default() -> Self {
        Self(DEFAULT_SYSTEM_PROMPT.to_string())
    }
}

impl SystemPrompt {
    pub fn new(text: &str) -> Self {
        Self(text.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn set(&mut self, text: &str) {
        self.0 = text.to_string();
    }
}

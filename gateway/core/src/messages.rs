//! Conversation Messages
//!
//! The message types shared by every backend. A conversation is an ordered
//! `Vec<Message>`; messages are never edited after construction, backends only
//! ever read or filter them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of a message author
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instructions
    System,
    /// End user input
    User,
    /// Model output
    Assistant,
}

impl MessageRole {
    /// Wire name of the role (`system`, `user`, `assistant`)
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Who wrote the message
    pub role: MessageRole,
    /// Message text
    pub content: String,
}

impl Message {
    /// Create a message with an explicit role
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Whether this is a system message
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.role == MessageRole::System
    }

    /// Content length in characters (the unit of the truncation budget)
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

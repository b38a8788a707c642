//! Bounded, role-tagged conversation history.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Who said a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One utterance in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// FIFO history that never holds more than `cap` messages.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    messages: VecDeque<Message>,
    cap: usize,
}

impl ConversationHistory {
    /// Creates an empty history. A cap of 0 is raised to 1.
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            messages: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Appends a message, evicting the oldest ones beyond the cap.
    pub fn push(&mut self, message: Message) {
        self.messages.push_back(message);
        while self.messages.len() > self.cap {
            self.messages.pop_front();
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(Message::assistant(content));
    }

    /// Removes the newest message if it is a user message.
    ///
    /// Used when a reply could not be produced for it.
    pub fn pop_unanswered(&mut self) -> Option<Message> {
        if self.messages.back().is_some_and(|m| m.role == Role::User) {
            self.messages.pop_back()
        } else {
            None
        }
    }

    /// Messages oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

//! Reply-generation port.

use crate::conversation::history::Message;
use crate::error::{Result, TalkbackError};
use std::sync::{Arc, Mutex};

/// Produces the assistant's next message from the conversation so far.
pub trait ReplyGateway: Send + Sync {
    /// `history` is ordered oldest first and ends with the user's message.
    fn generate(&self, system_prompt: &str, history: &[Message]) -> Result<String>;

    fn model_name(&self) -> &str;
}

impl<T: ReplyGateway + ?Sized> ReplyGateway for Arc<T> {
    fn generate(&self, system_prompt: &str, history: &[Message]) -> Result<String> {
        (**self).generate(system_prompt, history)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// Mock replier for testing.
///
/// Answers with a fixed response, or echoes the last user message when no
/// response is configured. Every history it receives is recorded.
#[derive(Debug, Clone, Default)]
pub struct MockReplier {
    response: Option<String>,
    should_fail: bool,
    received: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl MockReplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, response: &str) -> Self {
        self.response = Some(response.to_string());
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Histories passed to `generate`, in call order.
    pub fn received(&self) -> Vec<Vec<Message>> {
        self.received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl ReplyGateway for MockReplier {
    fn generate(&self, _system_prompt: &str, history: &[Message]) -> Result<String> {
        if let Ok(mut received) = self.received.lock() {
            received.push(history.to_vec());
        }
        if self.should_fail {
            return Err(TalkbackError::Reply {
                message: "mock reply failure".to_string(),
            });
        }
        Ok(match &self.response {
            Some(response) => response.clone(),
            None => history
                .last()
                .map(|m| format!("echo: {}", m.content))
                .unwrap_or_default(),
        })
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echoes_last_message_by_default() {
        let replier = MockReplier::new();
        let reply = replier
            .generate("sys", &[Message::user("a"), Message::user("b")])
            .unwrap();
        assert_eq!(reply, "echo: b");
    }

    #[test]
    fn test_fixed_response_and_recording() {
        let replier = MockReplier::new().with_response("ok");
        let shared: Arc<dyn ReplyGateway> = Arc::new(replier.clone());
        assert_eq!(shared.generate("sys", &[Message::user("hi")]).unwrap(), "ok");
        assert_eq!(replier.received(), vec![vec![Message::user("hi")]]);
    }

    #[test]
    fn test_failure() {
        let err = MockReplier::new().with_failure().generate("sys", &[]).unwrap_err();
        assert_eq!(err.to_string(), "Reply generation failed: mock reply failure");
    }
}

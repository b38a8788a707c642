//! Speech-to-text port.

use crate::audio::frame::NormalizedAudio;
use crate::error::{Result, TalkbackError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Turns an utterance into text.
///
/// An empty string means the backend heard nothing usable; it is not an error.
pub trait TranscriptionGateway: Send + Sync {
    /// Transcribe canonical audio, hinting the expected language (ISO-639-1).
    fn transcribe(&self, audio: &NormalizedAudio, language: &str) -> Result<String>;

    /// Name of the backing model, for logs.
    fn model_name(&self) -> &str;
}

impl<T: TranscriptionGateway + ?Sized> TranscriptionGateway for Arc<T> {
    fn transcribe(&self, audio: &NormalizedAudio, language: &str) -> Result<String> {
        (**self).transcribe(audio, language)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// Mock transcriber for testing
#[derive(Debug, Clone)]
pub struct MockTranscriber {
    model_name: String,
    response: String,
    should_fail: bool,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockTranscriber {
    /// Create a new mock transcriber with default settings
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            response: "mock transcription".to_string(),
            should_fail: false,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Configure the mock to return a specific response
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Configure the mock to fail on transcribe
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of transcribe calls, shared between clones
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TranscriptionGateway for MockTranscriber {
    fn transcribe(&self, _audio: &NormalizedAudio, _language: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.should_fail {
            Err(TalkbackError::Transcription {
                message: "mock transcription failure".to_string(),
            })
        } else {
            Ok(self.response.clone())
        }
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio() -> NormalizedAudio {
        NormalizedAudio::new(vec![0.0; 1000], 16000)
    }

    #[test]
    fn test_mock_transcriber_returns_response() {
        let transcriber = MockTranscriber::new("test-model").with_response("xin chào");
        assert_eq!(transcriber.transcribe(&audio(), "vi").unwrap(), "xin chào");
        assert_eq!(transcriber.call_count(), 1);
    }

    #[test]
    fn test_mock_transcriber_returns_error_when_configured() {
        let transcriber = MockTranscriber::new("test-model").with_failure();
        match transcriber.transcribe(&audio(), "vi") {
            Err(TalkbackError::Transcription { message }) => {
                assert_eq!(message, "mock transcription failure");
            }
            other => panic!("Expected Transcription error, got {other:?}"),
        }
    }

    #[test]
    fn test_call_count_shared_between_clones() {
        let transcriber = MockTranscriber::new("m");
        let shared: Arc<dyn TranscriptionGateway> = Arc::new(transcriber.clone());
        shared.transcribe(&audio(), "vi").unwrap();
        shared.transcribe(&audio(), "vi").unwrap();
        assert_eq!(transcriber.call_count(), 2);
        assert_eq!(shared.model_name(), "m");
    }
}

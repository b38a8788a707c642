//! talkback - spoken conversation with a language model
//!
//! Live voice segmentation feeding a transcribe → reply → synthesize → play
//! pipeline whose stages degrade instead of hanging.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod artifacts;
pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod conversation;
pub mod defaults;
#[cfg(feature = "cli")]
pub mod diagnostics;
pub mod error;
pub mod fallback;
pub mod gateway;
pub mod session;
pub mod subprocess;

// Composition root - needs everything
#[cfg(all(feature = "http", feature = "cli"))]
pub mod app;

// Ports (capture → segment → converse → play)
pub use audio::{AudioDeviceSource, PlaybackSink};
pub use gateway::{ReplyGateway, SynthesisGateway, TranscriptionGateway};

// Core types
pub use audio::{AudioFrame, AudioIngestNormalizer, NormalizedAudio};
pub use audio::{Segment, SegmentDetector, SegmentOutcome, SegmentState, SegmenterConfig};
pub use conversation::{ConversationHistory, ConversationOrchestrator, TurnOutcome, TurnStage};
pub use fallback::{FallbackChain, Provider};
pub use session::{LiveSessionHandle, TurnResult, VoiceSession};

// Error handling
pub use error::{Result, TalkbackError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_contains_plus_when_git_hash_present() {
        let ver = version_string();
        if option_env!("GIT_HASH").is_some_and(|h| !h.is_empty()) {
            let hash_part = ver.split('+').nth(1).unwrap_or("");
            assert_eq!(hash_part.len(), 7, "Git hash should be 7 chars, got: {}", ver);
        } else {
            assert_eq!(ver, env!("CARGO_PKG_VERSION"));
        }
    }
}

//! Ports to the external speech and language capabilities, and their adapters.

pub mod command;
#[cfg(feature = "http")]
pub mod openai;
pub mod reply;
pub mod synthesis;
pub mod transcription;

pub use command::CommandSynthesizer;
#[cfg(feature = "http")]
pub use openai::{OpenAiReplier, OpenAiSpeech, OpenAiTranscriber};
pub use reply::{MockReplier, ReplyGateway};
pub use synthesis::{
    MockSynthesizer, SpeechSynthesizer, SynthesisGateway, Synthesized, TONE_PROVIDER, tone,
    truncate_for_synthesis,
};
pub use transcription::{MockTranscriber, TranscriptionGateway};

//! Default configuration constants for talkback.
//!
//! Shared by the config structs and by the components' own `Default` impls
//! so both agree on a single value.

/// Canonical sample rate in Hz for every buffer inside the pipeline.
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per captured frame (64 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 1024;

/// Capacity of the capture → segmenter channel, in frames.
///
/// 256 frames is ~16 s of audio; a consumer that falls further behind
/// starts losing frames instead of buffering without bound.
pub const CHANNEL_CAPACITY: usize = 256;

/// Peak amplitude above which a frame counts as voiced.
pub const ACTIVITY_THRESHOLD: f32 = 0.01;

/// Continuous silence that ends an utterance, in milliseconds.
pub const SILENCE_MS: u64 = 1000;

/// Minimum recording length before silence may end it, in milliseconds.
pub const MIN_RECORDING_MS: u64 = 500;

/// Hard cap on a single recording, in milliseconds.
pub const MAX_RECORDING_MS: u64 = 30_000;

/// How long the segmenter waits on the frame channel before re-checking budgets.
pub const POLL_MS: u64 = 100;

/// Utterances shorter than this are treated as no input.
pub const MIN_UTTERANCE_MS: u64 = 100;

/// Default conversation language (ISO-639-1).
pub const LANGUAGE: &str = "vi";

/// Default speech-to-text model.
pub const STT_MODEL: &str = "whisper-1";

/// Default reply model.
pub const LLM_MODEL: &str = "gpt-3.5-turbo";

/// Default speech synthesis model and voice for the primary tier.
pub const TTS_MODEL: &str = "tts-1";
pub const TTS_VOICE: &str = "alloy";

/// Voice passed to espeak-ng for the secondary synthesis tier.
pub const ESPEAK_VOICE: &str = "vi";

/// OpenAI-compatible API base URL.
pub const API_BASE: &str = "https://api.openai.com/v1";

/// Environment variable holding the API credential.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Reply length limit sent to the model.
pub const MAX_TOKENS: u32 = 150;

/// Reply sampling temperature.
pub const TEMPERATURE: f32 = 0.7;

/// Messages kept in the conversation history.
pub const HISTORY_CAP: usize = 10;

/// Characters of reply text handed to synthesis.
pub const SYNTHESIS_MAX_CHARS: usize = 200;

/// Appended to text cut at [`SYNTHESIS_MAX_CHARS`].
pub const TRUNCATION_MARKER: &str = "...";

/// Speech speed multiplier.
pub const SPEECH_SPEED: f32 = 1.0;

/// Per-tier synthesis deadlines in seconds.
pub const PRIMARY_TTS_TIMEOUT_SECS: u64 = 10;
pub const SECONDARY_TTS_TIMEOUT_SECS: u64 = 5;
pub const TERTIARY_TTS_TIMEOUT_SECS: u64 = 5;

/// Request deadline for the transcription and reply gateways.
pub const GATEWAY_TIMEOUT_SECS: u64 = 30;

/// Deadline for the ffmpeg decode tier.
pub const FFMPEG_TIMEOUT_SECS: u64 = 15;

/// Deadline for the in-process decode tier.
pub const NATIVE_DECODE_TIMEOUT_SECS: u64 = 10;

/// Placeholder tone used when every synthesis tier failed.
pub const TONE_FREQUENCY_HZ: f32 = 440.0;
pub const TONE_AMPLITUDE: f32 = 0.1;
pub const TONE_SECS_PER_CHAR: f32 = 0.1;
pub const TONE_MIN_SECS: f32 = 0.3;
pub const TONE_MAX_SECS: f32 = 3.0;

/// Phrases that end the session instead of producing a reply.
pub const EXIT_PHRASES: &[&str] = &["thoát", "exit", "quit", "bye", "tạm biệt"];

/// Transcripts the STT model emits for silence or noise.
pub const IGNORED_TRANSCRIPTS: &[&str] = &["you", "thank you", "thanks"];

/// Default system instruction for the reply model.
pub const SYSTEM_PROMPT: &str = "You are a friendly, helpful voice assistant. \
Always answer in the user's language (Vietnamese unless told otherwise). \
Keep answers short: two or three spoken sentences at most. \
Use plain, everyday words and avoid jargon. \
If you did not understand the question, politely ask the user to repeat it.";

/// Prompt that primes the STT model toward the conversation language.
pub const TRANSCRIPTION_PROMPT: &str = "Đây là đoạn audio tiếng Việt.";

/// How long stopping a live session waits for the turn in flight.
pub const SESSION_STOP_TIMEOUT_SECS: u64 = 40;

/// Turn results buffered for a live session's consumer.
pub const RESULTS_CAPACITY: usize = 32;

/// Reply artifacts kept before the oldest untaken one is evicted.
pub const ARTIFACT_CAPACITY: usize = 16;

use crate::audio::vad::SegmenterConfig;
use crate::defaults;
use crate::error::{Result, TalkbackError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub segmenter: SegmenterSection,
    pub transcription: TranscriptionConfig,
    pub reply: ReplyConfig,
    pub synthesis: SynthesisConfig,
    pub conversation: ConversationConfig,
    pub ingest: IngestConfig,
}

/// Audio device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name; `None` picks the best default.
    pub device: Option<String>,
    /// Pipeline sample rate in Hz.
    pub sample_rate: u32,
    /// Frame length in milliseconds.
    pub frame_ms: u64,
    /// Capture channel capacity in frames.
    pub channel_capacity: usize,
    /// Play replies through the speakers.
    pub playback: bool,
}

/// Voice-activity segmentation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SegmenterSection {
    pub activity_threshold: f32,
    pub silence_ms: u64,
    pub min_recording_ms: u64,
    pub max_recording_ms: u64,
    /// How long the segmenter waits on the frame channel per poll.
    pub poll_ms: u64,
}

/// Speech-to-text gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub endpoint: String,
    pub model: String,
    pub language: String,
    pub prompt: String,
    pub timeout_secs: u64,
}

/// Reply gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplyConfig {
    pub endpoint: String,
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Messages of context kept between turns.
    pub history_cap: usize,
    pub timeout_secs: u64,
}

/// Speech synthesis tiers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SynthesisConfig {
    pub speed: f32,
    /// Characters of reply text handed to synthesis.
    pub max_chars: usize,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub espeak_program: String,
    pub espeak_voice: String,
    pub say_program: String,
    pub primary_timeout_secs: u64,
    pub secondary_timeout_secs: u64,
    pub tertiary_timeout_secs: u64,
}

/// Turn handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConversationConfig {
    /// Phrases that end the session, matched case-insensitively after trimming.
    pub exit_phrases: Vec<String>,
    /// Transcripts treated as "no speech".
    pub ignored_transcripts: Vec<String>,
    /// Shorter input is treated as no input.
    pub min_utterance_ms: u64,
    /// Reply artifacts kept before the oldest untaken one is evicted.
    pub max_artifacts: usize,
}

/// Uploaded-audio decoding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// ffmpeg executable name or path.
    pub ffmpeg: String,
    pub ffmpeg_timeout_secs: u64,
    pub native_timeout_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            frame_ms: (defaults::FRAME_SAMPLES as u64 * 1000) / u64::from(defaults::SAMPLE_RATE),
            channel_capacity: defaults::CHANNEL_CAPACITY,
            playback: true,
        }
    }
}

impl AudioConfig {
    /// Samples per frame at the configured rate.
    pub fn frame_samples(&self) -> usize {
        ((u64::from(self.sample_rate) * self.frame_ms) / 1000).max(1) as usize
    }
}

impl Default for SegmenterSection {
    fn default() -> Self {
        Self {
            activity_threshold: defaults::ACTIVITY_THRESHOLD,
            silence_ms: defaults::SILENCE_MS,
            min_recording_ms: defaults::MIN_RECORDING_MS,
            max_recording_ms: defaults::MAX_RECORDING_MS,
            poll_ms: defaults::POLL_MS,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::API_BASE.to_string(),
            model: defaults::STT_MODEL.to_string(),
            language: defaults::LANGUAGE.to_string(),
            prompt: defaults::TRANSCRIPTION_PROMPT.to_string(),
            timeout_secs: defaults::GATEWAY_TIMEOUT_SECS,
        }
    }
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::API_BASE.to_string(),
            model: defaults::LLM_MODEL.to_string(),
            system_prompt: defaults::SYSTEM_PROMPT.to_string(),
            max_tokens: defaults::MAX_TOKENS,
            temperature: defaults::TEMPERATURE,
            history_cap: defaults::HISTORY_CAP,
            timeout_secs: defaults::GATEWAY_TIMEOUT_SECS,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            speed: defaults::SPEECH_SPEED,
            max_chars: defaults::SYNTHESIS_MAX_CHARS,
            endpoint: defaults::API_BASE.to_string(),
            model: defaults::TTS_MODEL.to_string(),
            voice: defaults::TTS_VOICE.to_string(),
            espeak_program: "espeak-ng".to_string(),
            espeak_voice: defaults::ESPEAK_VOICE.to_string(),
            say_program: "say".to_string(),
            primary_timeout_secs: defaults::PRIMARY_TTS_TIMEOUT_SECS,
            secondary_timeout_secs: defaults::SECONDARY_TTS_TIMEOUT_SECS,
            tertiary_timeout_secs: defaults::TERTIARY_TTS_TIMEOUT_SECS,
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            exit_phrases: defaults::EXIT_PHRASES.iter().map(|s| s.to_string()).collect(),
            ignored_transcripts: defaults::IGNORED_TRANSCRIPTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_utterance_ms: defaults::MIN_UTTERANCE_MS,
            max_artifacts: defaults::ARTIFACT_CAPACITY,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffmpeg_timeout_secs: defaults::FFMPEG_TIMEOUT_SECS,
            native_timeout_secs: defaults::NATIVE_DECODE_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only a missing file yields defaults; invalid TOML is an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(TalkbackError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(TalkbackError::Config(e)) => Err(TalkbackError::ConfigParse {
                message: format!("{}: {e}", path.display()),
            }),
            Err(e) => Err(e),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - TALKBACK_LANGUAGE → transcription.language
    /// - TALKBACK_AUDIO_DEVICE → audio.device
    /// - TALKBACK_STT_MODEL → transcription.model
    /// - TALKBACK_LLM_MODEL → reply.model
    /// - TALKBACK_API_BASE → every gateway endpoint
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(language) = std::env::var("TALKBACK_LANGUAGE")
            && !language.is_empty()
        {
            self.transcription.language = language;
        }

        if let Ok(device) = std::env::var("TALKBACK_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        if let Ok(model) = std::env::var("TALKBACK_STT_MODEL")
            && !model.is_empty()
        {
            self.transcription.model = model;
        }

        if let Ok(model) = std::env::var("TALKBACK_LLM_MODEL")
            && !model.is_empty()
        {
            self.reply.model = model;
        }

        if let Ok(base) = std::env::var("TALKBACK_API_BASE")
            && !base.is_empty()
        {
            self.transcription.endpoint = base.clone();
            self.reply.endpoint = base.clone();
            self.synthesis.endpoint = base;
        }

        self
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: &str) -> Result<()> {
            Err(TalkbackError::ConfigInvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            })
        }

        let threshold = self.segmenter.activity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return invalid("segmenter.activity_threshold", "must be within (0, 1]");
        }
        if self.audio.sample_rate == 0 {
            return invalid("audio.sample_rate", "must be greater than zero");
        }
        if self.audio.frame_ms == 0 {
            return invalid("audio.frame_ms", "must be greater than zero");
        }
        if self.audio.channel_capacity == 0 {
            return invalid("audio.channel_capacity", "must be greater than zero");
        }
        if self.segmenter.max_recording_ms == 0 {
            return invalid("segmenter.max_recording_ms", "must be greater than zero");
        }
        if self.segmenter.silence_ms > self.segmenter.max_recording_ms {
            return invalid(
                "segmenter.silence_ms",
                "must not exceed segmenter.max_recording_ms",
            );
        }
        if self.reply.history_cap == 0 {
            return invalid("reply.history_cap", "must be greater than zero");
        }
        if self.synthesis.max_chars == 0 {
            return invalid("synthesis.max_chars", "must be greater than zero");
        }
        if !(self.synthesis.speed > 0.0) {
            return invalid("synthesis.speed", "must be greater than zero");
        }
        if self.conversation.max_artifacts == 0 {
            return invalid("conversation.max_artifacts", "must be greater than zero");
        }
        if self.segmenter.poll_ms == 0 {
            return invalid("segmenter.poll_ms", "must be greater than zero");
        }
        let timeouts = [
            ("transcription.timeout_secs", self.transcription.timeout_secs),
            ("reply.timeout_secs", self.reply.timeout_secs),
            ("synthesis.primary_timeout_secs", self.synthesis.primary_timeout_secs),
            ("synthesis.secondary_timeout_secs", self.synthesis.secondary_timeout_secs),
            ("synthesis.tertiary_timeout_secs", self.synthesis.tertiary_timeout_secs),
            ("ingest.ffmpeg_timeout_secs", self.ingest.ffmpeg_timeout_secs),
            ("ingest.native_timeout_secs", self.ingest.native_timeout_secs),
        ];
        if let Some((key, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return invalid(key, "must be greater than zero");
        }
        Ok(())
    }

    /// Segmenter settings at the pipeline sample rate.
    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            activity_threshold: self.segmenter.activity_threshold,
            silence: Duration::from_millis(self.segmenter.silence_ms),
            min_recording: Duration::from_millis(self.segmenter.min_recording_ms),
            max_recording: Duration::from_millis(self.segmenter.max_recording_ms),
            sample_rate: self.audio.sample_rate,
        }
    }

    /// API credential from the environment, never from the file.
    pub fn api_key() -> Option<String> {
        std::env::var(defaults::API_KEY_ENV)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    /// Like [`api_key`](Self::api_key), but a missing key is an error.
    pub fn require_api_key() -> Result<String> {
        Self::api_key().ok_or_else(|| TalkbackError::MissingCredential {
            name: defaults::API_KEY_ENV.to_string(),
        })
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/talkback/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("talkback")
            .join("config.toml")
    }
}

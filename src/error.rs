//! Error types for talkback.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TalkbackError {
    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Missing required credential: {name}")]
    MissingCredential { name: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio device errors
    #[error("Audio device unavailable: {device}")]
    DeviceUnavailable { device: String },

    #[error("Audio device busy: {device} is already {activity}")]
    DeviceBusy { device: String, activity: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Audio playback failed: {message}")]
    Playback { message: String },

    // Pipeline stage errors
    #[error("Audio decode failed: {message}")]
    AudioDecode { message: String },

    #[error("Transcription failed: {message}")]
    Transcription { message: String },

    #[error("Reply generation failed: {message}")]
    Reply { message: String },

    #[error("Speech synthesis failed: {message}")]
    Synthesis { message: String },

    // Artifact errors
    #[error("Audio artifact not found: {id}")]
    ArtifactNotFound { id: String },

    #[error("Invalid audio artifact id: {id}")]
    InvalidArtifactId { id: String },

    // WAV container errors
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, TalkbackError>;

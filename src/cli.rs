//! Command-line interface for talkback
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Spoken conversation with a language model
#[derive(Parser, Debug)]
#[command(name = "talkback", version, about = "Spoken conversation with a language model")]
pub struct Cli {
    /// Subcommand to execute (default: chat)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug logs, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Audio input device (see `talkback devices`)
    #[arg(long, global = true, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Conversation language code (default: vi). Examples: vi, en, de
    #[arg(long, global = true, value_name = "LANG")]
    pub language: Option<String>,

    /// Do not play replies through the speakers
    #[arg(long, global = true)]
    pub no_playback: bool,

    /// Longest single recording (default: 30s). Examples: 10s, 1m, 1500ms
    #[arg(long, global = true, value_name = "DURATION", value_parser = parse_duration_ms)]
    pub max_recording: Option<u64>,
}

/// Parse a duration string into milliseconds.
///
/// Bare numbers are seconds; anything else goes through `humantime`
/// (`30s`, `1500ms`, `1m30s`).
pub fn parse_duration_ms(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs * 1000);
    }
    humantime::parse_duration(s)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Talk live until Ctrl+C or an exit phrase
    Chat,

    /// Run one turn on a recorded audio file
    Turn {
        /// Audio file (wav, mp3, or anything ffmpeg reads)
        file: PathBuf,

        /// Container format, when the file name does not tell (e.g. webm, audio/mpeg)
        #[arg(long, value_name = "FORMAT")]
        format: Option<String>,

        /// Write the spoken reply to this WAV file
        #[arg(short, long, value_name = "OUT")]
        output: Option<PathBuf>,
    },

    /// Speak text through the synthesis tiers
    Speak {
        /// Text to speak
        text: String,

        /// Write the audio to this WAV file instead of playing it
        #[arg(short, long, value_name = "OUT")]
        output: Option<PathBuf>,
    },

    /// List available audio input devices
    Devices,

    /// Check external tools and credentials
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_defaults_to_chat() {
        let cli = Cli::try_parse_from(["talkback"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "talkback",
            "chat",
            "--language",
            "en",
            "--device",
            "pulse",
            "--no-playback",
            "-vv",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Chat)));
        assert_eq!(cli.language.as_deref(), Some("en"));
        assert_eq!(cli.device.as_deref(), Some("pulse"));
        assert!(cli.no_playback);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_turn_command() {
        let cli = Cli::try_parse_from([
            "talkback",
            "turn",
            "question.webm",
            "--format",
            "webm",
            "-o",
            "reply.wav",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Turn {
                file,
                format,
                output,
            }) => {
                assert_eq!(file, PathBuf::from("question.webm"));
                assert_eq!(format.as_deref(), Some("webm"));
                assert_eq!(output, Some(PathBuf::from("reply.wav")));
            }
            other => panic!("expected turn, got {other:?}"),
        }
    }

    #[test]
    fn test_speak_requires_text() {
        assert!(Cli::try_parse_from(["talkback", "speak"]).is_err());
        let cli = Cli::try_parse_from(["talkback", "speak", "xin chào"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Speak { .. })));
    }

    #[test]
    fn test_parse_duration_ms() {
        assert_eq!(parse_duration_ms("30"), Ok(30_000));
        assert_eq!(parse_duration_ms("10s"), Ok(10_000));
        assert_eq!(parse_duration_ms("1500ms"), Ok(1500));
        assert_eq!(parse_duration_ms("1m30s"), Ok(90_000));
        assert!(parse_duration_ms("soon").is_err());
    }

    #[test]
    fn test_max_recording_flag() {
        let cli = Cli::try_parse_from(["talkback", "--max-recording", "12s"]).unwrap();
        assert_eq!(cli.max_recording, Some(12_000));
    }
}

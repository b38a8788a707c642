//! Synthesis through local command-line engines (espeak-ng, macOS `say`).

use crate::audio::frame::NormalizedAudio;
use crate::audio::wav::{decode_wav, downmix};
use crate::defaults;
use crate::error::{Result, TalkbackError};
use crate::gateway::synthesis::SynthesisGateway;
use crate::subprocess::output_with_deadline;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Words per minute at speed 1.0.
const BASE_WPM: f32 = 175.0;

/// Runs an external program that writes a WAV file.
///
/// Arguments may contain the placeholders `{text}`, `{output}` (path of a
/// temporary `.wav` file the program must write) and `{wpm}`. A program
/// still running after the timeout is killed.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSynthesizer {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            timeout: Duration::from_secs(defaults::SECONDARY_TTS_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// espeak-ng with the given voice.
    pub fn espeak(program: &str, voice: &str) -> Self {
        Self::new(
            "espeak",
            program,
            ["-v", voice, "-s", "{wpm}", "-w", "{output}", "{text}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    /// macOS `say`, writing 32-bit float samples at 22.05 kHz.
    pub fn say(program: &str) -> Self {
        Self::new(
            "say",
            program,
            [
                "-o",
                "{output}",
                "--data-format=LEF32@22050",
                "-r",
                "{wpm}",
                "{text}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether the program can be found on `PATH` (or at its explicit path).
    pub fn is_available(&self) -> bool {
        find_program(&self.program).is_some()
    }

    fn expand_args(&self, text: &str, output: &Path, speed: f32) -> Vec<String> {
        let wpm = ((BASE_WPM * speed).round() as u32).max(1).to_string();
        let output = output.to_string_lossy();
        // a leading dash would be read as an option
        let text = text.trim_start_matches('-');
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{output}", &output)
                    .replace("{wpm}", &wpm)
                    .replace("{text}", text)
            })
            .collect()
    }
}

impl SynthesisGateway for CommandSynthesizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn synthesize(&self, text: &str, speed: f32) -> Result<NormalizedAudio> {
        let output = tempfile::Builder::new()
            .prefix("talkback-tts-")
            .suffix(".wav")
            .tempfile()?;
        let args = self.expand_args(text, output.path(), speed);

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let result = output_with_deadline(&mut command, self.timeout).map_err(|e| {
            TalkbackError::Synthesis {
                message: format!("cannot run {}: {e}", self.program),
            }
        })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(TalkbackError::Synthesis {
                message: format!(
                    "{} exited with {}: {}",
                    self.program,
                    result.status,
                    stderr.trim()
                ),
            });
        }

        let bytes = std::fs::read(output.path())?;
        if bytes.is_empty() {
            return Ok(NormalizedAudio::empty(defaults::SAMPLE_RATE));
        }
        let pcm = decode_wav(&bytes).map_err(|e| TalkbackError::Synthesis {
            message: format!("{} wrote unreadable audio: {e}", self.program),
        })?;
        Ok(NormalizedAudio::new(
            downmix(&pcm.samples, pcm.channels),
            pcm.sample_rate,
        ))
    }
}

/// Resolves a program name against `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| full.is_file())
}

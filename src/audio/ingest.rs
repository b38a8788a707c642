//! Uploaded-audio normalisation.
//!
//! Turns an arbitrary audio blob into [`NormalizedAudio`]: decode, down-mix,
//! resample, clip. Decoding goes through a [`FallbackChain`] whose first tier
//! shells out to ffmpeg and whose second decodes WAV/MP3 in-process.

use crate::audio::frame::NormalizedAudio;
use crate::audio::wav::{PcmBuffer, decode_wav, downmix, resample};
use crate::config::IngestConfig;
use crate::defaults;
use crate::error::{Result, TalkbackError};
use crate::fallback::{FallbackChain, Provider, describe_attempts};
use crate::subprocess::output_with_deadline;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// Container formats recognised by the in-process decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    /// Anything else, by lower-cased extension (`webm`, `ogg`, `m4a`, ...).
    Other(String),
}

impl AudioFormat {
    /// Parses a declared format: an extension (`wav`, `.mp3`), a file name or a MIME type.
    pub fn from_declared(declared: &str) -> Option<Self> {
        let declared = declared.trim().to_ascii_lowercase();
        if declared.is_empty() {
            return None;
        }
        let token = match declared.split_once('/') {
            // MIME type, drop parameters such as `;codecs=opus`
            Some((_, subtype)) => subtype.split(';').next().unwrap_or(subtype).trim().to_string(),
            None => declared
                .rsplit('.')
                .next()
                .unwrap_or(declared.as_str())
                .to_string(),
        };
        Some(match token.as_str() {
            "wav" | "wave" | "x-wav" | "vnd.wave" => AudioFormat::Wav,
            "mp3" | "mpeg" | "mpeg3" | "x-mpeg-3" => AudioFormat::Mp3,
            other => AudioFormat::Other(other.to_string()),
        })
    }

    /// Detects WAV and MP3 from magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            return Some(AudioFormat::Wav);
        }
        if bytes.starts_with(b"ID3") {
            return Some(AudioFormat::Mp3);
        }
        // MPEG audio frame sync: 11 set bits
        if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0 {
            return Some(AudioFormat::Mp3);
        }
        None
    }

    /// File extension for temporary files.
    pub fn extension(&self) -> &str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Other(ext) => ext,
        }
    }
}

/// An uploaded blob with its declared format; cheap to clone across decode tiers.
#[derive(Debug, Clone)]
pub struct UploadedAudio {
    bytes: Arc<[u8]>,
    declared: Option<AudioFormat>,
}

impl UploadedAudio {
    pub fn new(bytes: &[u8], declared: Option<&str>) -> Self {
        Self {
            bytes: Arc::from(bytes),
            declared: declared.and_then(AudioFormat::from_declared),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn declared(&self) -> Option<&AudioFormat> {
        self.declared.as_ref()
    }

    /// Sniffed format, falling back to the declared one.
    pub fn format(&self) -> Option<AudioFormat> {
        AudioFormat::sniff(&self.bytes).or_else(|| self.declared.clone())
    }
}

/// Decode tier that runs ffmpeg and reads raw 16-bit mono PCM from its stdout.
///
/// An ffmpeg still running after `timeout` is killed.
pub struct FfmpegDecoder {
    program: PathBuf,
    target_rate: u32,
    timeout: Duration,
}

impl FfmpegDecoder {
    pub fn new(program: impl Into<PathBuf>, target_rate: u32) -> Self {
        Self {
            program: program.into(),
            target_rate,
            timeout: Duration::from_secs(defaults::FFMPEG_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Provider<UploadedAudio, PcmBuffer> for FfmpegDecoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn invoke(&self, input: &UploadedAudio) -> Result<PcmBuffer> {
        let suffix = format!(
            ".{}",
            input.format().as_ref().map(|f| f.extension()).unwrap_or("bin")
        );
        let mut upload = tempfile::Builder::new()
            .prefix("talkback-upload-")
            .suffix(&suffix)
            .tempfile()?;
        upload.write_all(input.bytes())?;
        upload.flush()?;

        let mut command = Command::new(&self.program);
        command
            .arg("-hide_banner")
            .args(["-loglevel", "error", "-nostdin", "-i"])
            .arg(upload.path())
            .args(["-f", "s16le", "-acodec", "pcm_s16le", "-ac", "1", "-ar"])
            .arg(self.target_rate.to_string())
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = output_with_deadline(&mut command, self.timeout).map_err(|e| {
            TalkbackError::AudioDecode {
                message: format!("cannot run {}: {e}", self.program.display()),
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().last().unwrap_or("no diagnostics");
            return Err(TalkbackError::AudioDecode {
                message: format!("ffmpeg exited with {}: {detail}", output.status),
            });
        }

        let samples = output
            .stdout
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect();
        Ok(PcmBuffer::new(samples, self.target_rate, 1))
    }
}

/// In-process decode tier for WAV (hound) and MP3 (minimp3).
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeDecoder;

impl Provider<UploadedAudio, PcmBuffer> for NativeDecoder {
    fn name(&self) -> &str {
        "native"
    }

    fn invoke(&self, input: &UploadedAudio) -> Result<PcmBuffer> {
        match input.format() {
            Some(AudioFormat::Wav) => decode_wav(input.bytes()),
            Some(AudioFormat::Mp3) => decode_mp3(input.bytes()),
            Some(AudioFormat::Other(ext)) => Err(TalkbackError::AudioDecode {
                message: format!("no in-process decoder for .{ext}"),
            }),
            None => Err(TalkbackError::AudioDecode {
                message: "unrecognised audio container".to_string(),
            }),
        }
    }
}

/// Decodes an MP3 stream to interleaved samples.
pub fn decode_mp3(bytes: &[u8]) -> Result<PcmBuffer> {
    let mut decoder = minimp3::Decoder::new(bytes);
    let mut samples: Vec<f32> = Vec::new();
    let mut layout: Option<(u32, u16)> = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                let rate = frame.sample_rate.max(0) as u32;
                let channels = frame.channels as u16;
                match layout {
                    None => layout = Some((rate, channels)),
                    Some(existing) if existing != (rate, channels) => {
                        return Err(TalkbackError::AudioDecode {
                            message: "MP3 stream changes format mid-stream".to_string(),
                        });
                    }
                    Some(_) => {}
                }
                samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => continue,
            Err(e) => {
                return Err(TalkbackError::AudioDecode {
                    message: format!("MP3 decode error: {e}"),
                });
            }
        }
    }

    match layout {
        Some((rate, channels)) if rate > 0 && channels > 0 => {
            Ok(PcmBuffer::new(samples, rate, channels))
        }
        _ => Err(TalkbackError::AudioDecode {
            message: "no MP3 frames found".to_string(),
        }),
    }
}

/// Converts uploaded audio into canonical mono samples at the target rate.
pub struct AudioIngestNormalizer {
    target_rate: u32,
    decoders: FallbackChain<UploadedAudio, PcmBuffer>,
}

impl AudioIngestNormalizer {
    /// Normalizer with a custom decode chain.
    pub fn new(target_rate: u32, decoders: FallbackChain<UploadedAudio, PcmBuffer>) -> Self {
        Self {
            target_rate,
            decoders,
        }
    }

    /// ffmpeg first, then the in-process decoder.
    pub fn from_config(config: &IngestConfig, target_rate: u32) -> Self {
        let decoders = FallbackChain::new("decode")
            .with_tier(
                Arc::new(
                    FfmpegDecoder::new(&config.ffmpeg, target_rate)
                        .with_timeout(Duration::from_secs(config.ffmpeg_timeout_secs)),
                ),
                Duration::from_secs(config.ffmpeg_timeout_secs),
            )
            .with_tier(
                Arc::new(NativeDecoder),
                Duration::from_secs(config.native_timeout_secs),
            );
        Self::new(target_rate, decoders)
    }

    /// In-process decoding only.
    pub fn native_only(target_rate: u32) -> Self {
        let decoders = FallbackChain::new("decode").with_tier(
            Arc::new(NativeDecoder),
            Duration::from_secs(crate::defaults::NATIVE_DECODE_TIMEOUT_SECS),
        );
        Self::new(target_rate, decoders)
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Decodes and normalises an uploaded blob.
    ///
    /// Fails with [`TalkbackError::AudioDecode`] when every decoder gives up;
    /// undecodable input is never reported as empty audio.
    pub fn normalize(&self, bytes: &[u8], declared_format: Option<&str>) -> Result<NormalizedAudio> {
        if bytes.is_empty() {
            return Err(TalkbackError::AudioDecode {
                message: "uploaded audio is empty".to_string(),
            });
        }

        let upload = UploadedAudio::new(bytes, declared_format);
        let resolved = self
            .decoders
            .try_run(&upload)
            .map_err(|attempts| TalkbackError::AudioDecode {
                message: describe_attempts(&attempts),
            })?;

        tracing::debug!(
            decoder = %resolved.provider,
            native_rate = resolved.output.sample_rate,
            channels = resolved.output.channels,
            "decoded upload"
        );
        Ok(self.normalize_pcm(resolved.output))
    }

    /// Down-mixes, resamples and clips already-decoded samples.
    pub fn normalize_pcm(&self, pcm: PcmBuffer) -> NormalizedAudio {
        let mono = if pcm.channels > 1 {
            downmix(&pcm.samples, pcm.channels)
        } else {
            pcm.samples
        };
        let samples = if pcm.sample_rate != self.target_rate {
            resample(&mono, pcm.sample_rate, self.target_rate)
        } else {
            mono
        };
        NormalizedAudio::new(samples, self.target_rate)
    }
}

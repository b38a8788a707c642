//! WAV encoding/decoding and sample-format helpers.

use crate::audio::frame::NormalizedAudio;
use crate::error::{Result, TalkbackError};
use crate::fallback::Payload;
use std::io::Cursor;
use std::path::Path;

/// Decoded audio before normalisation: interleaved samples at the native layout.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    /// Interleaved samples, nominally in [-1.0, 1.0].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Number of sample frames (one sample per channel).
    pub fn frame_count(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }
}

impl Payload for PcmBuffer {
    fn is_empty_payload(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decodes a WAV container of any integer width or 32-bit float.
pub fn decode_wav(bytes: &[u8]) -> Result<PcmBuffer> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| TalkbackError::AudioDecode {
            message: format!("Failed to parse WAV data: {e}"),
        })?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(TalkbackError::AudioDecode {
            message: format!(
                "WAV header declares {} channels at {} Hz",
                spec.channels, spec.sample_rate
            ),
        });
    }

    let samples: std::result::Result<Vec<f32>, hound::Error> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect(),
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect()
        }
    };
    let samples = samples.map_err(|e| TalkbackError::AudioDecode {
        message: format!("Failed to read WAV samples: {e}"),
    })?;

    Ok(PcmBuffer::new(samples, spec.sample_rate, spec.channels))
}

/// Encodes mono samples as a 16-bit PCM WAV.
pub fn encode_wav(audio: &NormalizedAudio) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in audio.samples() {
            writer.write_sample(to_i16(sample))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Writes `audio` to `path` as a 16-bit PCM WAV.
pub fn write_wav_file(path: &Path, audio: &NormalizedAudio) -> Result<()> {
    let bytes = encode_wav(audio)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Converts a float sample to 16-bit PCM.
pub fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Averages interleaved channels into mono.
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Simple linear interpolation resampling.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as f32
            }
        })
        .collect()
}

/// Removes DC offset and scales the peak to `target_peak`.
///
/// Silent input is returned unchanged.
pub fn remove_dc_and_normalize(samples: &[f32], target_peak: f32) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    let centered: Vec<f32> = samples.iter().map(|s| s - mean).collect();
    let peak = centered.iter().fold(0.0f32, |p, s| p.max(s.abs()));
    if peak <= f32::EPSILON {
        return centered;
    }
    let gain = target_peak / peak;
    centered.iter().map(|s| s * gain).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_wav_data(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn decode_16bit_mono() {
        let wav = make_wav_data(16000, 1, &[0, 16384, -16384, 32767]);
        let pcm = decode_wav(&wav).unwrap();
        assert_eq!(pcm.sample_rate, 16000);
        assert_eq!(pcm.channels, 1);
        assert_eq!(pcm.samples.len(), 4);
        assert!((pcm.samples[1] - 0.5).abs() < 1e-4);
        assert!((pcm.samples[2] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn decode_float_wav() {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for s in [0.25f32, -0.25, 0.5, -0.5] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let pcm = decode_wav(&cursor.into_inner()).unwrap();
        assert_eq!(pcm.channels, 2);
        assert_eq!(pcm.frame_count(), 2);
        assert_eq!(pcm.samples, vec![0.25, -0.25, 0.5, -0.5]);
    }

    #[test]
    fn decode_garbage_is_decode_error() {
        let err = decode_wav(b"definitely not a wav file").unwrap_err();
        assert!(matches!(err, TalkbackError::AudioDecode { .. }));
    }

    #[test]
    fn encode_then_decode_keeps_rate_and_length() {
        let audio = NormalizedAudio::new(vec![0.0, 0.5, -0.5, 1.0], 16000);
        let bytes = encode_wav(&audio).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");

        let pcm = decode_wav(&bytes).unwrap();
        assert_eq!(pcm.sample_rate, 16000);
        assert_eq!(pcm.samples.len(), 4);
        for (a, b) in audio.samples().iter().zip(&pcm.samples) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn write_wav_file_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        write_wav_file(&path, &NormalizedAudio::new(vec![0.1; 160], 16000)).unwrap();
        let pcm = decode_wav(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(pcm.samples.len(), 160);
    }

    #[test]
    fn to_i16_clamps() {
        assert_eq!(to_i16(1.0), 32767);
        assert_eq!(to_i16(2.0), 32767);
        assert_eq!(to_i16(-2.0), -32768);
        assert_eq!(to_i16(0.0), 0);
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [0.2, 0.4, -1.0, 1.0, 0.5, 0.5];
        let mono = downmix(&stereo, 2);
        assert_eq!(mono.len(), 3);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!(mono[1].abs() < 1e-6);
        assert!((mono[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn downmix_mono_is_identity() {
        assert_eq!(downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&input, 16000, 16000), input);
    }

    #[test]
    fn resample_48k_to_16k_length_and_level() {
        let input = vec![0.25f32; 48000];
        let output = resample(&input, 48000, 16000);
        assert_eq!(output.len(), 16000);
        assert!(output.iter().all(|s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn resample_upsamples() {
        let output = resample(&[0.0, 1.0], 8000, 16000);
        assert_eq!(output.len(), 4);
        assert!((output[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn remove_dc_and_normalize_centers_and_scales() {
        let out = remove_dc_and_normalize(&[0.6, 0.4, 0.6, 0.4], 0.9);
        assert!((out[0] - 0.9).abs() < 1e-5);
        assert!((out[1] + 0.9).abs() < 1e-5);
    }

    #[test]
    fn remove_dc_on_silence_does_not_divide_by_zero() {
        let out = remove_dc_and_normalize(&[0.0; 8], 0.9);
        assert!(out.iter().all(|s| *s == 0.0));
        assert!(remove_dc_and_normalize(&[], 0.9).is_empty());
    }
}

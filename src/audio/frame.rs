//! Sample buffers that flow through the pipeline.

use std::time::{Duration, Instant};

/// A fixed-size block of mono samples produced by a capture source.
///
/// Owned by the producer until it is sent on the frame channel, then by the
/// consumer. Every frame of one capture session has the same length.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sequence number for ordering and gap detection.
    pub sequence: u64,
    /// When the frame was captured.
    pub timestamp: Instant,
}

impl AudioFrame {
    /// Creates a new audio frame.
    pub fn new(samples: Vec<f32>, sequence: u64, timestamp: Instant) -> Self {
        Self {
            samples,
            sequence,
            timestamp,
        }
    }

    /// Largest absolute sample value in the frame.
    pub fn peak(&self) -> f32 {
        peak_amplitude(&self.samples)
    }

    /// Playback length of the frame at `sample_rate`.
    pub fn duration(&self, sample_rate: u32) -> Duration {
        samples_to_duration(self.samples.len(), sample_rate)
    }
}

/// Canonical audio: mono `f32` samples in [-1.0, 1.0] at the pipeline rate.
///
/// Produced by the segmenter, the ingest normalizer and synthesis, and
/// consumed by transcription and playback.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl NormalizedAudio {
    /// Wraps samples, clipping them to [-1.0, 1.0]. Non-finite values become 0.
    pub fn new(mut samples: Vec<f32>, sample_rate: u32) -> Self {
        for s in samples.iter_mut() {
            *s = if s.is_finite() { s.clamp(-1.0, 1.0) } else { 0.0 };
        }
        Self {
            samples,
            sample_rate,
        }
    }

    /// An empty buffer at `sample_rate`.
    pub fn empty(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
        }
    }

    /// Concatenates frames in arrival order.
    pub fn from_frames(frames: &[AudioFrame], sample_rate: u32) -> Self {
        let total = frames.iter().map(|f| f.samples.len()).sum();
        let mut samples = Vec::with_capacity(total);
        for frame in frames {
            samples.extend_from_slice(&frame.samples);
        }
        Self::new(samples, sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }

    pub fn peak(&self) -> f32 {
        peak_amplitude(&self.samples)
    }
}

/// Largest absolute sample value, 0.0 for an empty slice.
pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}

/// Converts a sample count at `sample_rate` into a duration.
pub fn samples_to_duration(count: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(count as f64 / sample_rate as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_frame_creation() {
        let timestamp = Instant::now();
        let frame = AudioFrame::new(vec![0.1, -0.5, 0.25], 42, timestamp);

        assert_eq!(frame.samples, vec![0.1, -0.5, 0.25]);
        assert_eq!(frame.sequence, 42);
        assert_eq!(frame.timestamp, timestamp);
        assert!((frame.peak() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 1600], 0, Instant::now());
        assert_eq!(frame.duration(16000), Duration::from_millis(100));
    }

    #[test]
    fn test_normalized_audio_clips_out_of_range() {
        let audio = NormalizedAudio::new(vec![1.5, -2.0, 0.3, f32::NAN], 16000);
        assert_eq!(audio.samples(), &[1.0, -1.0, 0.3, 0.0]);
    }

    #[test]
    fn test_normalized_audio_from_frames_keeps_order() {
        let now = Instant::now();
        let frames = vec![
            AudioFrame::new(vec![0.1, 0.2], 0, now),
            AudioFrame::new(vec![0.3], 1, now),
        ];
        let audio = NormalizedAudio::from_frames(&frames, 16000);
        assert_eq!(audio.samples(), &[0.1, 0.2, 0.3]);
        assert_eq!(audio.sample_rate(), 16000);
    }

    #[test]
    fn test_empty_audio() {
        let audio = NormalizedAudio::empty(16000);
        assert!(audio.is_empty());
        assert_eq!(audio.duration(), Duration::ZERO);
        assert_eq!(audio.peak(), 0.0);
    }

    #[test]
    fn test_samples_to_duration_zero_rate() {
        assert_eq!(samples_to_duration(100, 0), Duration::ZERO);
    }
}

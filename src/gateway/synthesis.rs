//! Speech-synthesis port and the degrading synthesizer built on it.
//!
//! Each [`SynthesisGateway`] becomes one tier of a [`FallbackChain`]. When
//! every tier misses, a short tone stands in for the reply so the turn still
//! produces audio.

use crate::audio::frame::NormalizedAudio;
use crate::audio::wav::resample;
use crate::defaults;
use crate::error::{Result, TalkbackError};
use crate::fallback::{Attempt, FallbackChain, Provider};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Name reported when the placeholder tone was used.
pub const TONE_PROVIDER: &str = "tone";

/// One speech-synthesis backend.
pub trait SynthesisGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Speak `text` at `speed` (1.0 = normal). May return audio at any sample rate.
    fn synthesize(&self, text: &str, speed: f32) -> Result<NormalizedAudio>;
}

impl<T: SynthesisGateway + ?Sized> SynthesisGateway for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn synthesize(&self, text: &str, speed: f32) -> Result<NormalizedAudio> {
        (**self).synthesize(text, speed)
    }
}

/// Input of one synthesis chain run.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub speed: f32,
}

/// Adapts a gateway to a chain tier, resampling its output to the pipeline rate.
pub struct SynthesisTier {
    gateway: Arc<dyn SynthesisGateway>,
    target_rate: u32,
}

impl SynthesisTier {
    pub fn new(gateway: Arc<dyn SynthesisGateway>, target_rate: u32) -> Self {
        Self {
            gateway,
            target_rate,
        }
    }
}

impl Provider<SynthesisRequest, NormalizedAudio> for SynthesisTier {
    fn name(&self) -> &str {
        self.gateway.name()
    }

    fn invoke(&self, input: &SynthesisRequest) -> Result<NormalizedAudio> {
        let audio = self.gateway.synthesize(&input.text, input.speed)?;
        if audio.sample_rate() == self.target_rate || audio.is_empty() {
            return Ok(NormalizedAudio::new(audio.into_samples(), self.target_rate));
        }
        let from = audio.sample_rate();
        Ok(NormalizedAudio::new(
            resample(audio.samples(), from, self.target_rate),
            self.target_rate,
        ))
    }
}

/// Cuts `text` to `max_chars` characters and appends the truncation marker.
///
/// Text within the limit is returned unchanged.
pub fn truncate_for_synthesis(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((byte_idx, _)) => format!("{}{}", &text[..byte_idx], defaults::TRUNCATION_MARKER),
    }
}

/// Placeholder tone: 440 Hz, 0.1 s per character, clamped to [0.3 s, 3 s].
pub fn tone(text: &str, sample_rate: u32) -> NormalizedAudio {
    let secs = (text.chars().count() as f32 * defaults::TONE_SECS_PER_CHAR)
        .clamp(defaults::TONE_MIN_SECS, defaults::TONE_MAX_SECS);
    let len = (secs * sample_rate as f32).round() as usize;
    let step = 2.0 * std::f32::consts::PI * defaults::TONE_FREQUENCY_HZ / sample_rate.max(1) as f32;
    let samples = (0..len)
        .map(|i| (i as f32 * step).sin() * defaults::TONE_AMPLITUDE)
        .collect();
    NormalizedAudio::new(samples, sample_rate)
}

/// Output of [`SpeechSynthesizer::synthesize`].
#[derive(Debug, Clone)]
pub struct Synthesized {
    pub audio: NormalizedAudio,
    /// Tier that produced the audio, or [`TONE_PROVIDER`].
    pub provider: String,
    /// The (possibly truncated) text that was spoken.
    pub text: String,
    /// Tiers that missed before `provider`.
    pub attempts: Vec<Attempt>,
}

impl Synthesized {
    /// True when every tier missed and the tone was used.
    pub fn is_degraded(&self) -> bool {
        self.provider == TONE_PROVIDER
    }
}

/// Text-to-speech over an ordered list of backends.
pub struct SpeechSynthesizer {
    chain: FallbackChain<SynthesisRequest, NormalizedAudio>,
    max_chars: usize,
    speed: f32,
    target_rate: u32,
}

impl SpeechSynthesizer {
    pub fn new(target_rate: u32) -> Self {
        Self {
            chain: FallbackChain::new("synthesis"),
            max_chars: defaults::SYNTHESIS_MAX_CHARS,
            speed: defaults::SPEECH_SPEED,
            target_rate,
        }
    }

    /// Appends a backend as the next tier.
    pub fn with_tier(mut self, gateway: Arc<dyn SynthesisGateway>, timeout: Duration) -> Self {
        self.push_tier(gateway, timeout);
        self
    }

    pub fn push_tier(&mut self, gateway: Arc<dyn SynthesisGateway>, timeout: Duration) {
        self.chain
            .push_tier(Arc::new(SynthesisTier::new(gateway, self.target_rate)), timeout);
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.chain.provider_names()
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Speaks `text`. Never fails: exhausting every tier yields the tone.
    pub fn synthesize(&self, text: &str) -> Synthesized {
        let request = SynthesisRequest {
            text: truncate_for_synthesis(text.trim(), self.max_chars),
            speed: self.speed,
        };
        let rate = self.target_rate;
        let resolved = self
            .chain
            .run(&request, TONE_PROVIDER, |req| tone(&req.text, rate));

        tracing::info!(
            provider = %resolved.provider,
            chars = request.text.chars().count(),
            duration_ms = resolved.output.duration().as_millis() as u64,
            "synthesized reply"
        );

        Synthesized {
            audio: resolved.output,
            provider: resolved.provider,
            text: request.text,
            attempts: resolved.attempts,
        }
    }
}

/// Mock synthesizer for testing.
///
/// Produces half a second of constant signal and records every text it receives.
#[derive(Debug, Clone)]
pub struct MockSynthesizer {
    name: String,
    should_fail: bool,
    empty: bool,
    delay: Duration,
    sample_rate: u32,
    received: Arc<Mutex<Vec<String>>>,
}

impl MockSynthesizer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            should_fail: false,
            empty: false,
            delay: Duration::ZERO,
            sample_rate: defaults::SAMPLE_RATE,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Succeed with no samples.
    pub fn with_empty_output(mut self) -> Self {
        self.empty = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Produce audio at a rate other than the pipeline's.
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Texts passed to `synthesize`, in call order.
    pub fn received(&self) -> Vec<String> {
        self.received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl SynthesisGateway for MockSynthesizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn synthesize(&self, text: &str, _speed: f32) -> Result<NormalizedAudio> {
        if let Ok(mut received) = self.received.lock() {
            received.push(text.to_string());
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.should_fail {
            return Err(TalkbackError::Synthesis {
                message: format!("{} unavailable", self.name),
            });
        }
        if self.empty {
            return Ok(NormalizedAudio::empty(self.sample_rate));
        }
        Ok(NormalizedAudio::new(
            vec![0.2; self.sample_rate as usize / 2],
            self.sample_rate,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_truncate_short_text_unchanged() {
        assert_eq!(truncate_for_synthesis("xin chào", 200), "xin chào");
        let exact = "a".repeat(200);
        assert_eq!(truncate_for_synthesis(&exact, 200), exact);
    }

    #[test]
    fn test_truncate_long_text_adds_marker() {
        let text = "hello".repeat(100);
        let cut = truncate_for_synthesis(&text, 200);
        assert_eq!(cut.chars().count(), 203);
        assert!(cut.ends_with("..."));
        assert!(cut.starts_with("hellohello"));
    }

    #[test]
    fn test_truncate_counts_characters_not_bytes() {
        let text = "ă".repeat(300);
        let cut = truncate_for_synthesis(&text, 200);
        assert_eq!(cut.chars().count(), 203);
    }

    #[test]
    fn test_tone_duration_is_clamped() {
        assert_eq!(tone("ab", 16000).len(), 4800); // 0.3 s floor
        assert_eq!(tone("0123456789", 16000).len(), 16000); // 1 s
        assert_eq!(tone(&"x".repeat(203), 16000).len(), 48000); // 3 s cap
    }

    #[test]
    fn test_tone_amplitude() {
        let peak = tone("hello", 16000).peak();
        assert!(peak <= 0.1 + 1e-6);
        assert!(peak > 0.09);
    }

    #[test]
    fn test_first_working_tier_is_used() {
        let primary = MockSynthesizer::new("primary").with_failure();
        let secondary = MockSynthesizer::new("secondary");
        let synth = SpeechSynthesizer::new(16000)
            .with_tier(Arc::new(primary.clone()), Duration::from_secs(1))
            .with_tier(Arc::new(secondary.clone()), Duration::from_secs(1));

        let out = synth.synthesize("xin chào");
        assert_eq!(out.provider, "secondary");
        assert!(!out.is_degraded());
        assert_eq!(out.attempts.len(), 1);
        assert_eq!(primary.received(), vec!["xin chào".to_string()]);
    }

    #[test]
    fn test_empty_tier_output_moves_on() {
        let synth = SpeechSynthesizer::new(16000)
            .with_tier(
                Arc::new(MockSynthesizer::new("silent").with_empty_output()),
                Duration::from_secs(1),
            )
            .with_tier(Arc::new(MockSynthesizer::new("real")), Duration::from_secs(1));
        assert_eq!(synth.synthesize("hi").provider, "real");
    }

    #[test]
    fn test_exhausted_tiers_yield_tone() {
        let synth = SpeechSynthesizer::new(16000)
            .with_tier(Arc::new(MockSynthesizer::new("a").with_failure()), Duration::from_secs(1))
            .with_tier(Arc::new(MockSynthesizer::new("b").with_failure()), Duration::from_secs(1));
        let out = synth.synthesize("hello");
        assert!(out.is_degraded());
        assert_eq!(out.provider, TONE_PROVIDER);
        assert_eq!(out.audio.len(), 8000);
    }

    #[test]
    fn test_slow_tier_is_abandoned() {
        let synth = SpeechSynthesizer::new(16000)
            .with_tier(
                Arc::new(MockSynthesizer::new("slow").with_delay(Duration::from_secs(3))),
                Duration::from_millis(50),
            )
            .with_tier(Arc::new(MockSynthesizer::new("fast")), Duration::from_secs(1));
        let started = Instant::now();
        let out = synth.synthesize("hi");
        assert_eq!(out.provider, "fast");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_gateway_receives_truncated_text() {
        let mock = MockSynthesizer::new("m");
        let synth = SpeechSynthesizer::new(16000)
            .with_max_chars(200)
            .with_tier(Arc::new(mock.clone()), Duration::from_secs(1));
        let out = synth.synthesize(&"hello".repeat(100));
        let received = mock.received();
        assert_eq!(received.len(), 1);
        assert!(received[0].chars().count() <= 203);
        assert_eq!(out.text, received[0]);
    }

    #[test]
    fn test_tier_output_resampled_to_target_rate() {
        let synth = SpeechSynthesizer::new(16000).with_tier(
            Arc::new(MockSynthesizer::new("hifi").with_sample_rate(24000)),
            Duration::from_secs(1),
        );
        let out = synth.synthesize("hi");
        assert_eq!(out.audio.sample_rate(), 16000);
        assert_eq!(out.audio.len(), 8000);
    }

    #[test]
    fn test_tier_names() {
        let synth = SpeechSynthesizer::new(16000)
            .with_tier(Arc::new(MockSynthesizer::new("a")), Duration::from_secs(1))
            .with_tier(Arc::new(MockSynthesizer::new("b")), Duration::from_secs(1));
        assert_eq!(synth.tier_names(), vec!["a", "b"]);
    }
}

//! One conversational turn: transcribe → reply → synthesize → play.
//!
//! Stage failures become [`TurnOutcome`] values; nothing raised by a gateway
//! escapes [`ConversationOrchestrator::run_turn`]. Turns run strictly one
//! after another on the caller's thread.

use crate::audio::frame::NormalizedAudio;
use crate::audio::playback::PlaybackSink;
use crate::config::Config;
use crate::conversation::history::{ConversationHistory, Message};
use crate::defaults;
use crate::gateway::reply::ReplyGateway;
use crate::gateway::synthesis::{SpeechSynthesizer, Synthesized};
use crate::gateway::transcription::TranscriptionGateway;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Where a turn is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStage {
    AwaitingInput,
    Transcribing,
    Replying,
    Synthesizing,
    Playing,
    Idle,
    Failed,
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnStage::AwaitingInput => "awaiting input",
            TurnStage::Transcribing => "transcribing",
            TurnStage::Replying => "replying",
            TurnStage::Synthesizing => "synthesizing",
            TurnStage::Playing => "playing",
            TurnStage::Idle => "idle",
            TurnStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What happened to the synthesized reply on the speakers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackStatus {
    Played,
    /// No sink configured, or the session was cancelled first; the reply is
    /// text (and artifact) only.
    Skipped,
    Failed(String),
}

/// A turn that produced a reply.
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub user_text: String,
    pub reply_text: String,
    /// Spoken reply at the pipeline rate.
    pub audio: NormalizedAudio,
    /// Synthesis tier that produced `audio`.
    pub provider: String,
    /// Every synthesis tier missed and `audio` is the placeholder tone.
    pub degraded: bool,
    pub playback: PlaybackStatus,
}

/// Result of one turn.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// Input was empty or shorter than the minimum utterance.
    NoInput,
    /// The input held no usable speech.
    NoSpeech,
    /// The user said an exit phrase; the session should end.
    Exit { user_text: String },
    Completed(TurnReply),
    /// The turn was aborted; the session can continue.
    Failed { stage: TurnStage, reason: String },
}

impl TurnOutcome {
    pub fn is_exit(&self) -> bool {
        matches!(self, TurnOutcome::Exit { .. })
    }

    pub fn reply(&self) -> Option<&TurnReply> {
        match self {
            TurnOutcome::Completed(reply) => Some(reply),
            _ => None,
        }
    }

    pub fn user_text(&self) -> Option<&str> {
        match self {
            TurnOutcome::Completed(reply) => Some(&reply.user_text),
            TurnOutcome::Exit { user_text } => Some(user_text),
            _ => None,
        }
    }

    pub fn reply_text(&self) -> Option<&str> {
        self.reply().map(|r| r.reply_text.as_str())
    }

    /// Failure reason for aborted turns.
    pub fn reason(&self) -> Option<&str> {
        match self {
            TurnOutcome::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Turn handling settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub language: String,
    pub system_prompt: String,
    pub exit_phrases: Vec<String>,
    pub ignored_transcripts: Vec<String>,
    pub min_utterance: Duration,
    pub history_cap: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            language: defaults::LANGUAGE.to_string(),
            system_prompt: defaults::SYSTEM_PROMPT.to_string(),
            exit_phrases: defaults::EXIT_PHRASES.iter().map(|s| s.to_string()).collect(),
            ignored_transcripts: defaults::IGNORED_TRANSCRIPTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_utterance: Duration::from_millis(defaults::MIN_UTTERANCE_MS),
            history_cap: defaults::HISTORY_CAP,
        }
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            language: config.transcription.language.clone(),
            system_prompt: config.reply.system_prompt.clone(),
            exit_phrases: config.conversation.exit_phrases.clone(),
            ignored_transcripts: config.conversation.ignored_transcripts.clone(),
            min_utterance: Duration::from_millis(config.conversation.min_utterance_ms),
            history_cap: config.reply.history_cap,
        }
    }
}

/// Lower-cases, trims and drops trailing `.`, `!`, `?` and `,`.
pub fn normalize_phrase(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .trim_end_matches(['.', '!', '?', ','])
        .trim()
        .to_string()
}

fn matches_any(text: &str, phrases: &[String]) -> bool {
    let normalized = normalize_phrase(text);
    phrases.iter().any(|p| normalize_phrase(p) == normalized)
}

/// Drives turns against the three gateways, keeping the bounded history.
pub struct ConversationOrchestrator {
    transcriber: Arc<dyn TranscriptionGateway>,
    replier: Arc<dyn ReplyGateway>,
    synthesizer: SpeechSynthesizer,
    playback: Option<Arc<dyn PlaybackSink>>,
    history: ConversationHistory,
    config: OrchestratorConfig,
    stage: TurnStage,
    trace: Vec<TurnStage>,
}

impl ConversationOrchestrator {
    pub fn new(
        transcriber: Arc<dyn TranscriptionGateway>,
        replier: Arc<dyn ReplyGateway>,
        synthesizer: SpeechSynthesizer,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            transcriber,
            replier,
            synthesizer,
            playback: None,
            history: ConversationHistory::new(config.history_cap),
            config,
            stage: TurnStage::Idle,
            trace: Vec::new(),
        }
    }

    /// Plays replies through `sink`. Without one, turns are text-only.
    pub fn with_playback(mut self, sink: Arc<dyn PlaybackSink>) -> Self {
        self.playback = Some(sink);
        self
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn synthesizer(&self) -> &SpeechSynthesizer {
        &self.synthesizer
    }

    pub fn playback(&self) -> Option<&Arc<dyn PlaybackSink>> {
        self.playback.as_ref()
    }

    /// Current stage; `Idle` or `Failed` between turns.
    pub fn stage(&self) -> TurnStage {
        self.stage
    }

    /// Stages the last turn passed through, in order.
    pub fn stage_trace(&self) -> &[TurnStage] {
        &self.trace
    }

    /// True if `text` is one of the configured exit phrases.
    pub fn is_exit_phrase(&self, text: &str) -> bool {
        matches_any(text, &self.config.exit_phrases)
    }

    fn is_placeholder(&self, text: &str) -> bool {
        normalize_phrase(text).is_empty() || matches_any(text, &self.config.ignored_transcripts)
    }

    fn enter(&mut self, stage: TurnStage) {
        self.stage = stage;
        self.trace.push(stage);
    }

    fn fail(&mut self, stage: TurnStage, reason: String) -> TurnOutcome {
        tracing::warn!(%stage, %reason, "turn failed");
        self.enter(TurnStage::Failed);
        TurnOutcome::Failed { stage, reason }
    }

    /// Runs one full turn on `audio`.
    pub fn run_turn(&mut self, audio: NormalizedAudio) -> TurnOutcome {
        self.run_turn_until(audio, &AtomicBool::new(false))
    }

    /// Runs one turn, skipping playback if `cancel` is raised before the
    /// reply is ready to play.
    pub fn run_turn_until(&mut self, audio: NormalizedAudio, cancel: &AtomicBool) -> TurnOutcome {
        let started = Instant::now();
        self.trace.clear();
        self.enter(TurnStage::AwaitingInput);

        if audio.is_empty() || audio.duration() < self.config.min_utterance {
            tracing::debug!(
                duration_ms = audio.duration().as_millis() as u64,
                "input too short for a turn"
            );
            self.enter(TurnStage::Idle);
            return TurnOutcome::NoInput;
        }

        self.enter(TurnStage::Transcribing);
        let user_text = match self.transcriber.transcribe(&audio, &self.config.language) {
            Ok(text) => text.trim().to_string(),
            Err(e) => return self.fail(TurnStage::Transcribing, e.to_string()),
        };
        if self.is_placeholder(&user_text) {
            tracing::debug!(transcript = %user_text, "no usable speech in transcript");
            self.enter(TurnStage::Idle);
            return TurnOutcome::NoSpeech;
        }
        tracing::info!(
            model = self.transcriber.model_name(),
            text = %user_text,
            "transcribed utterance"
        );

        if self.is_exit_phrase(&user_text) {
            tracing::info!(text = %user_text, "exit phrase");
            self.enter(TurnStage::Idle);
            return TurnOutcome::Exit { user_text };
        }

        self.enter(TurnStage::Replying);
        self.history.push(Message::user(user_text.clone()));
        let context = self.history.messages();
        let reply_text = match self.replier.generate(&self.config.system_prompt, &context) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                self.history.pop_unanswered();
                return self.fail(TurnStage::Replying, "reply was empty".to_string());
            }
            Err(e) => {
                self.history.pop_unanswered();
                return self.fail(TurnStage::Replying, e.to_string());
            }
        };
        self.history.push(Message::assistant(reply_text.clone()));

        self.enter(TurnStage::Synthesizing);
        let synthesized = self.synthesizer.synthesize(&reply_text);
        let degraded = synthesized.is_degraded();
        let Synthesized {
            audio: reply_audio,
            provider,
            ..
        } = synthesized;

        let playback = match self.playback.clone() {
            Some(_) if cancel.load(Ordering::SeqCst) => {
                tracing::debug!("session cancelled, reply not played");
                PlaybackStatus::Skipped
            }
            Some(sink) => {
                self.enter(TurnStage::Playing);
                match sink.play(&reply_audio) {
                    Ok(()) => PlaybackStatus::Played,
                    Err(e) => {
                        tracing::warn!(error = %e, "playback failed, reply is text-only");
                        PlaybackStatus::Failed(e.to_string())
                    }
                }
            }
            None => PlaybackStatus::Skipped,
        };

        self.enter(TurnStage::Idle);
        tracing::info!(
            provider = %provider,
            degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn complete"
        );

        TurnOutcome::Completed(TurnReply {
            user_text,
            reply_text,
            audio: reply_audio,
            provider,
            degraded,
            playback,
        })
    }

    /// Interrupts a reply that is currently playing.
    pub fn interrupt_playback(&self) {
        if let Some(sink) = &self.playback {
            sink.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::MockPlaybackSink;
    use crate::gateway::reply::MockReplier;
    use crate::gateway::synthesis::{MockSynthesizer, TONE_PROVIDER};
    use crate::gateway::transcription::MockTranscriber;
    use crate::conversation::history::Role;

    const RATE: u32 = 16000;

    fn speech() -> NormalizedAudio {
        NormalizedAudio::new(vec![0.3; RATE as usize], RATE)
    }

    fn synthesizer() -> SpeechSynthesizer {
        SpeechSynthesizer::new(RATE).with_tier(
            Arc::new(MockSynthesizer::new("primary")),
            Duration::from_secs(1),
        )
    }

    fn orchestrator(transcriber: MockTranscriber, replier: MockReplier) -> ConversationOrchestrator {
        ConversationOrchestrator::new(
            Arc::new(transcriber),
            Arc::new(replier),
            synthesizer(),
            OrchestratorConfig::default(),
        )
    }

    #[test]
    fn test_completed_turn_passes_every_stage() {
        let sink = MockPlaybackSink::new();
        let mut orch = orchestrator(
            MockTranscriber::new("stt").with_response("xin chào"),
            MockReplier::new().with_response("Chào bạn!"),
        )
        .with_playback(Arc::new(sink.clone()));

        let outcome = orch.run_turn(speech());

        let reply = outcome.reply().unwrap();
        assert_eq!(reply.user_text, "xin chào");
        assert_eq!(reply.reply_text, "Chào bạn!");
        assert_eq!(reply.provider, "primary");
        assert!(!reply.degraded);
        assert_eq!(reply.playback, PlaybackStatus::Played);
        assert_eq!(sink.played().len(), 1);
        assert_eq!(
            orch.stage_trace(),
            &[
                TurnStage::AwaitingInput,
                TurnStage::Transcribing,
                TurnStage::Replying,
                TurnStage::Synthesizing,
                TurnStage::Playing,
                TurnStage::Idle,
            ]
        );
        let roles: Vec<Role> = orch.history().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[test]
    fn test_short_input_is_no_input_without_calling_gateways() {
        let transcriber = MockTranscriber::new("stt").with_response("hello");
        let mut orch = orchestrator(transcriber.clone(), MockReplier::new());

        assert!(matches!(
            orch.run_turn(NormalizedAudio::empty(RATE)),
            TurnOutcome::NoInput
        ));
        assert!(matches!(
            orch.run_turn(NormalizedAudio::new(vec![0.3; 160], RATE)),
            TurnOutcome::NoInput
        ));
        assert_eq!(transcriber.call_count(), 0);
        assert_eq!(orch.stage(), TurnStage::Idle);
    }

    #[test]
    fn test_placeholder_transcript_is_no_speech() {
        for transcript in ["", "   ", "Thank you.", "you", "THANKS!"] {
            let replier = MockReplier::new();
            let mut orch = orchestrator(
                MockTranscriber::new("stt").with_response(transcript),
                replier.clone(),
            );
            assert!(
                matches!(orch.run_turn(speech()), TurnOutcome::NoSpeech),
                "transcript {transcript:?}"
            );
            assert!(replier.received().is_empty());
            assert!(orch.history().is_empty());
        }
    }

    #[test]
    fn test_transcription_failure_aborts_turn() {
        let mut orch = orchestrator(MockTranscriber::new("stt").with_failure(), MockReplier::new());
        match orch.run_turn(speech()) {
            TurnOutcome::Failed { stage, reason } => {
                assert_eq!(stage, TurnStage::Transcribing);
                assert!(reason.contains("Transcription failed"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(orch.stage(), TurnStage::Failed);
    }

    #[test]
    fn test_reply_failure_removes_unanswered_message() {
        let mut orch = orchestrator(
            MockTranscriber::new("stt").with_response("câu hỏi"),
            MockReplier::new().with_failure(),
        );
        let outcome = orch.run_turn(speech());
        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                stage: TurnStage::Replying,
                ..
            }
        ));
        assert!(orch.history().is_empty());
    }

    #[test]
    fn test_empty_reply_is_failure() {
        let mut orch = orchestrator(
            MockTranscriber::new("stt").with_response("câu hỏi"),
            MockReplier::new().with_response("   "),
        );
        assert_eq!(orch.run_turn(speech()).reason(), Some("reply was empty"));
    }

    #[test]
    fn test_exit_phrase_ends_without_reply() {
        let replier = MockReplier::new();
        let mut orch = orchestrator(
            MockTranscriber::new("stt").with_response("  Tạm biệt. "),
            replier.clone(),
        );
        let outcome = orch.run_turn(speech());
        assert!(outcome.is_exit());
        assert_eq!(outcome.user_text(), Some("Tạm biệt."));
        assert!(replier.received().is_empty());
    }

    #[test]
    fn test_reply_sees_system_prompt_and_bounded_history() {
        let replier = MockReplier::new();
        let config = OrchestratorConfig {
            history_cap: 4,
            ..OrchestratorConfig::default()
        };
        let mut orch = ConversationOrchestrator::new(
            Arc::new(MockTranscriber::new("stt").with_response("again")),
            Arc::new(replier.clone()),
            synthesizer(),
            config,
        );
        for _ in 0..5 {
            orch.run_turn(speech());
        }
        let received = replier.received();
        assert_eq!(received.len(), 5);
        assert!(received.iter().all(|h| h.len() <= 4));
        assert_eq!(received[4].last().map(|m| m.role), Some(Role::User));
        assert_eq!(orch.history().len(), 4);
    }

    #[test]
    fn test_failed_synthesis_still_completes_with_tone() {
        let synth = SpeechSynthesizer::new(RATE).with_tier(
            Arc::new(MockSynthesizer::new("primary").with_failure()),
            Duration::from_secs(1),
        );
        let mut orch = ConversationOrchestrator::new(
            Arc::new(MockTranscriber::new("stt").with_response("hi there")),
            Arc::new(MockReplier::new().with_response("hello")),
            synth,
            OrchestratorConfig::default(),
        );
        let reply = orch.run_turn(speech()).reply().cloned().unwrap();
        assert!(reply.degraded);
        assert_eq!(reply.provider, TONE_PROVIDER);
        assert!(!reply.audio.is_empty());
        assert_eq!(reply.playback, PlaybackStatus::Skipped);
    }

    #[test]
    fn test_playback_failure_keeps_reply_text() {
        let mut orch = orchestrator(
            MockTranscriber::new("stt").with_response("hi there"),
            MockReplier::new().with_response("hello"),
        )
        .with_playback(Arc::new(MockPlaybackSink::new().with_failure()));

        let outcome = orch.run_turn(speech());
        assert_eq!(outcome.reply_text(), Some("hello"));
        assert!(matches!(
            outcome.reply().map(|r| &r.playback),
            Some(PlaybackStatus::Failed(_))
        ));
    }

    #[test]
    fn test_cancelled_turn_keeps_reply_but_does_not_play() {
        let sink = MockPlaybackSink::new();
        let mut orch = orchestrator(
            MockTranscriber::new("stt").with_response("hi there"),
            MockReplier::new().with_response("hello"),
        )
        .with_playback(Arc::new(sink.clone()));

        let outcome = orch.run_turn_until(speech(), &AtomicBool::new(true));

        assert_eq!(outcome.reply_text(), Some("hello"));
        assert_eq!(outcome.reply().map(|r| &r.playback), Some(&PlaybackStatus::Skipped));
        assert!(sink.played().is_empty());
        assert!(!orch.stage_trace().contains(&TurnStage::Playing));
    }

    #[test]
    fn test_normalize_phrase() {
        assert_eq!(normalize_phrase("  Bye!! "), "bye");
        assert_eq!(normalize_phrase("Thank you."), "thank you");
        assert_eq!(normalize_phrase("?"), "");
    }
}

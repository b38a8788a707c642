//! Voice-activity segmentation.
//!
//! Decides where an utterance starts and ends in a stream of frames using a
//! fixed peak-amplitude threshold and three time budgets: trailing silence,
//! minimum recording length and maximum recording length.

use crate::audio::frame::{AudioFrame, NormalizedAudio};
use crate::defaults;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Trait for time operations, allowing mock time in tests.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Real system clock using `std::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Configuration for segmentation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmenterConfig {
    /// Peak amplitude a frame must exceed to count as voiced (0.0 to 1.0).
    pub activity_threshold: f32,
    /// Continuous silence after speech that completes the utterance.
    pub silence: Duration,
    /// Recording length that must be reached before silence may complete it.
    pub min_recording: Duration,
    /// Recording length after which the session times out regardless of activity.
    pub max_recording: Duration,
    /// Sample rate of incoming frames.
    pub sample_rate: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            activity_threshold: defaults::ACTIVITY_THRESHOLD,
            silence: Duration::from_millis(defaults::SILENCE_MS),
            min_recording: Duration::from_millis(defaults::MIN_RECORDING_MS),
            max_recording: Duration::from_millis(defaults::MAX_RECORDING_MS),
            sample_rate: defaults::SAMPLE_RATE,
        }
    }
}

/// Where a recording session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// No session.
    Idle,
    /// Recording, no voice heard yet.
    Listening,
    /// Current frame is voiced.
    Voiced,
    /// Voice stopped; waiting to see if it resumes within the silence budget.
    TrailingSilence,
    /// Utterance ended by silence (or by the end of a finite input).
    Complete,
    /// Maximum recording length reached, or the session was cancelled.
    TimedOut,
}

impl SegmentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SegmentState::Complete | SegmentState::TimedOut)
    }
}

/// Result of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOutcome {
    /// Audio from the first voiced frame to the end of the session.
    Utterance(NormalizedAudio),
    /// The session ended without a single voiced frame.
    NoSpeechDetected,
}

/// A finished session together with how it got there.
#[derive(Debug, Clone)]
pub struct Segment {
    pub outcome: SegmentOutcome,
    /// Terminal state the session ended in.
    pub end_state: SegmentState,
    /// Every state the session passed through, starting at `Idle`.
    pub transitions: Vec<SegmentState>,
    /// The frame channel closed before the session ended on its own.
    pub input_closed: bool,
}

impl Segment {
    pub fn is_speech(&self) -> bool {
        matches!(self.outcome, SegmentOutcome::Utterance(_))
    }

    pub fn into_utterance(self) -> Option<NormalizedAudio> {
        match self.outcome {
            SegmentOutcome::Utterance(audio) => Some(audio),
            SegmentOutcome::NoSpeechDetected => None,
        }
    }
}

/// State of one recording, from `start_recording` until `finish`.
#[derive(Debug)]
pub struct RecordingSession {
    /// Frames kept for the utterance (from the first voiced frame on).
    frames: Vec<AudioFrame>,
    state: SegmentState,
    /// Wall-clock start, used for the max-duration guard while no frames arrive.
    started_at: Instant,
    /// Media time consumed so far (sum of frame durations).
    elapsed: Duration,
    /// Media time at the end of the most recent voiced frame.
    last_voice_at: Option<Duration>,
    transitions: Vec<SegmentState>,
}

impl RecordingSession {
    fn new(started_at: Instant) -> Self {
        Self {
            frames: Vec::new(),
            state: SegmentState::Listening,
            started_at,
            elapsed: Duration::ZERO,
            last_voice_at: None,
            transitions: vec![SegmentState::Idle, SegmentState::Listening],
        }
    }

    fn enter(&mut self, state: SegmentState) {
        if self.state != state {
            tracing::trace!(from = ?self.state, to = ?state, "segment state");
            self.state = state;
            self.transitions.push(state);
        }
    }
}

/// Voice-activity state machine over a stream of frames.
pub struct SegmentDetector<C: Clock = SystemClock> {
    config: SegmenterConfig,
    clock: C,
    session: Option<RecordingSession>,
}

impl<C: Clock> SegmentDetector<C> {
    /// Creates a detector with an injectable clock.
    pub fn with_clock(config: SegmenterConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            session: None,
        }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Current state; `Idle` when no session is open.
    pub fn state(&self) -> SegmentState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SegmentState::Idle)
    }

    /// Opens a new session (`Idle` → `Listening`), discarding any open one.
    pub fn start_recording(&mut self) {
        if self.session.is_some() {
            tracing::warn!("discarding unfinished recording session");
        }
        self.session = Some(RecordingSession::new(self.clock.now()));
    }

    /// Feeds one frame and returns the resulting state.
    ///
    /// Frames arriving while idle or after a terminal state are ignored.
    pub fn push_frame(&mut self, frame: AudioFrame) -> SegmentState {
        let config = self.config;
        let wall_now = self.clock.now();
        let Some(session) = self.session.as_mut() else {
            return SegmentState::Idle;
        };
        if session.state.is_terminal() {
            return session.state;
        }

        let voiced = frame.peak() > config.activity_threshold;
        session.elapsed += frame.duration(config.sample_rate);
        let elapsed = session.elapsed;

        match session.state {
            SegmentState::Listening => {
                if voiced {
                    session.frames.push(frame);
                    session.last_voice_at = Some(elapsed);
                    session.enter(SegmentState::Voiced);
                }
            }
            SegmentState::Voiced | SegmentState::TrailingSilence => {
                session.frames.push(frame);
                if voiced {
                    session.last_voice_at = Some(elapsed);
                    session.enter(SegmentState::Voiced);
                } else {
                    session.enter(SegmentState::TrailingSilence);
                }
            }
            _ => {}
        }

        if session.state == SegmentState::TrailingSilence {
            let silence = elapsed.saturating_sub(session.last_voice_at.unwrap_or_default());
            if silence >= config.silence && elapsed >= config.min_recording {
                session.enter(SegmentState::Complete);
            }
        }

        if !session.state.is_terminal() {
            let wall = wall_now.saturating_duration_since(session.started_at);
            if elapsed.max(wall) >= config.max_recording {
                tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, "recording timed out");
                session.enter(SegmentState::TimedOut);
            }
        }

        session.state
    }

    /// Re-checks the max-duration budget without a frame.
    pub fn tick(&mut self) -> SegmentState {
        let max = self.config.max_recording;
        let now = self.clock.now();
        let Some(session) = self.session.as_mut() else {
            return SegmentState::Idle;
        };
        if !session.state.is_terminal()
            && now.saturating_duration_since(session.started_at) >= max
        {
            tracing::debug!("recording timed out waiting for frames");
            session.enter(SegmentState::TimedOut);
        }
        session.state
    }

    /// Forces an open session into `TimedOut`.
    pub fn force_timeout(&mut self) {
        if let Some(session) = self.session.as_mut()
            && !session.state.is_terminal()
        {
            session.enter(SegmentState::TimedOut);
        }
    }

    /// Closes the session and returns what it captured; the detector is `Idle` afterwards.
    ///
    /// A session still in progress (the input ended early) is closed as `Complete`.
    pub fn finish(&mut self) -> Segment {
        let Some(mut session) = self.session.take() else {
            return Segment {
                outcome: SegmentOutcome::NoSpeechDetected,
                end_state: SegmentState::Idle,
                transitions: vec![SegmentState::Idle],
                input_closed: false,
            };
        };
        if !session.state.is_terminal() {
            session.enter(SegmentState::Complete);
        }

        let outcome = if session.frames.is_empty() {
            SegmentOutcome::NoSpeechDetected
        } else {
            SegmentOutcome::Utterance(NormalizedAudio::from_frames(
                &session.frames,
                self.config.sample_rate,
            ))
        };

        Segment {
            outcome,
            end_state: session.state,
            transitions: session.transitions,
            input_closed: false,
        }
    }

    /// Runs a whole session over an in-memory buffer cut into `frame_len` frames.
    pub fn segment_buffer(&mut self, audio: &NormalizedAudio, frame_len: usize) -> Segment {
        self.start_recording();
        let now = self.clock.now();
        for (sequence, chunk) in audio.samples().chunks(frame_len.max(1)).enumerate() {
            let frame = AudioFrame::new(chunk.to_vec(), sequence as u64, now);
            if self.push_frame(frame).is_terminal() {
                break;
            }
        }
        self.finish()
    }

    /// Consumes frames from `frames` until the session reaches a terminal state.
    ///
    /// Polls with `poll` so elapsed-time budgets are checked even when no
    /// frames arrive. Raising `cancel` forces the session into `TimedOut`.
    /// A disconnected channel ends the session as if the input ran out.
    pub fn capture(
        &mut self,
        frames: &Receiver<AudioFrame>,
        cancel: &AtomicBool,
        poll: Duration,
    ) -> Segment {
        self.start_recording();
        let mut input_closed = false;
        loop {
            if cancel.load(Ordering::SeqCst) {
                self.force_timeout();
                break;
            }
            let state = match frames.recv_timeout(poll) {
                Ok(frame) => self.push_frame(frame),
                Err(RecvTimeoutError::Timeout) => self.tick(),
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("frame channel closed during recording");
                    input_closed = true;
                    break;
                }
            };
            if state.is_terminal() {
                break;
            }
        }
        let mut segment = self.finish();
        segment.input_closed = input_closed;
        segment
    }
}

impl SegmentDetector<SystemClock> {
    /// Creates a detector using the system clock.
    pub fn new(config: SegmenterConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

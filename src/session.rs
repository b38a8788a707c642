//! Outward boundary of the engine: uploaded-audio turns and live sessions.
//!
//! Every collaborator is built once and handed in; the session owns no
//! process-wide state.

use crate::artifacts::{ArtifactId, ArtifactStore};
use crate::audio::frame::{AudioFrame, NormalizedAudio};
use crate::audio::ingest::AudioIngestNormalizer;
use crate::audio::playback::PlaybackSink;
use crate::audio::source::AudioDeviceSource;
use crate::audio::vad::{SegmentDetector, SegmentOutcome, SegmenterConfig};
use crate::config::Config;
use crate::conversation::orchestrator::{ConversationOrchestrator, TurnOutcome, TurnStage};
use crate::defaults;
use crate::error::{Result, TalkbackError};
use crate::gateway::synthesis::Synthesized;
use crossbeam_channel::{Receiver, TrySendError, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Opens the input device for a live session.
pub type SourceFactory = Box<dyn Fn() -> Result<Box<dyn AudioDeviceSource>> + Send + Sync>;

/// Capture and segmentation settings for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub segmenter: SegmenterConfig,
    /// Samples per frame.
    pub frame_len: usize,
    pub channel_capacity: usize,
    /// Segmenter poll interval on the frame channel.
    pub poll: Duration,
    pub stop_timeout: Duration,
    /// Reply artifacts kept before the oldest is evicted.
    pub artifact_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            segmenter: SegmenterConfig::default(),
            frame_len: defaults::FRAME_SAMPLES,
            channel_capacity: defaults::CHANNEL_CAPACITY,
            poll: Duration::from_millis(defaults::POLL_MS),
            stop_timeout: Duration::from_secs(defaults::SESSION_STOP_TIMEOUT_SECS),
            artifact_capacity: defaults::ARTIFACT_CAPACITY,
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            segmenter: config.segmenter_config(),
            frame_len: config.audio.frame_samples(),
            channel_capacity: config.audio.channel_capacity,
            poll: Duration::from_millis(config.segmenter.poll_ms),
            stop_timeout: Duration::from_secs(defaults::SESSION_STOP_TIMEOUT_SECS),
            artifact_capacity: config.conversation.max_artifacts,
        }
    }
}

/// What a caller gets back for one turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub outcome: TurnOutcome,
    /// Reply audio, retrievable once from the session's artifact store.
    pub artifact: Option<ArtifactId>,
}

impl TurnResult {
    fn without_artifact(outcome: TurnOutcome) -> Self {
        Self {
            outcome,
            artifact: None,
        }
    }

    pub fn user_text(&self) -> Option<&str> {
        self.outcome.user_text()
    }

    pub fn reply_text(&self) -> Option<&str> {
        self.outcome.reply_text()
    }

    pub fn is_exit(&self) -> bool {
        self.outcome.is_exit()
    }
}

fn lock(orchestrator: &Mutex<ConversationOrchestrator>) -> MutexGuard<'_, ConversationOrchestrator> {
    orchestrator.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs a turn and files its reply audio as an artifact.
fn run_and_store(
    orchestrator: &Mutex<ConversationOrchestrator>,
    artifacts: &ArtifactStore,
    audio: NormalizedAudio,
    cancel: &AtomicBool,
) -> TurnResult {
    let outcome = lock(orchestrator).run_turn_until(audio, cancel);
    let artifact = outcome.reply().and_then(|reply| {
        artifacts
            .store(&reply.audio)
            .inspect_err(|e| tracing::warn!(error = %e, "could not store reply audio"))
            .ok()
    });
    TurnResult { outcome, artifact }
}

/// A conversation with its collaborators wired together.
pub struct VoiceSession {
    normalizer: AudioIngestNormalizer,
    orchestrator: Arc<Mutex<ConversationOrchestrator>>,
    artifacts: Arc<ArtifactStore>,
    settings: SessionSettings,
    source_factory: Option<Arc<SourceFactory>>,
    live: Arc<AtomicBool>,
}

impl VoiceSession {
    pub fn new(
        normalizer: AudioIngestNormalizer,
        orchestrator: ConversationOrchestrator,
        settings: SessionSettings,
    ) -> Result<Self> {
        Ok(Self {
            normalizer,
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            artifacts: Arc::new(ArtifactStore::with_capacity(settings.artifact_capacity)?),
            settings,
            source_factory: None,
            live: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Device used by [`start_live_session`](Self::start_live_session).
    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.source_factory = Some(Arc::new(factory));
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Returns an artifact's WAV bytes; each artifact can be taken once.
    pub fn take_artifact(&self, id: &ArtifactId) -> Result<Vec<u8>> {
        self.artifacts.take(id)
    }

    /// Number of messages currently kept for reply context.
    pub fn history_len(&self) -> usize {
        lock(&self.orchestrator).history().len()
    }

    /// One turn on a complete uploaded recording.
    ///
    /// Fails only with [`TalkbackError::AudioDecode`]; everything after
    /// decoding is reported in the returned outcome.
    pub fn submit_uploaded_audio(
        &self,
        bytes: &[u8],
        declared_format: Option<&str>,
    ) -> Result<TurnResult> {
        let audio = self.normalizer.normalize(bytes, declared_format)?;
        tracing::debug!(
            duration_ms = audio.duration().as_millis() as u64,
            format = declared_format.unwrap_or("sniffed"),
            "upload normalized"
        );

        // the whole upload is scanned, however long it is
        let mut segmenter = self.settings.segmenter;
        segmenter.max_recording = segmenter
            .max_recording
            .max(audio.duration() + Duration::from_secs(1));
        let mut detector = SegmentDetector::new(segmenter);
        let segment = detector.segment_buffer(&audio, self.settings.frame_len);
        if !segment.is_speech() {
            tracing::info!(end_state = ?segment.end_state, "no speech in upload");
            return Ok(TurnResult::without_artifact(TurnOutcome::NoSpeech));
        }

        Ok(run_and_store(
            &self.orchestrator,
            &self.artifacts,
            audio,
            &AtomicBool::new(false),
        ))
    }

    /// Synthesizes `text` through the fallback tiers without a turn.
    pub fn speak(&self, text: &str) -> Synthesized {
        lock(&self.orchestrator).synthesizer().synthesize(text)
    }

    /// Plays `audio` on the session's output device.
    ///
    /// Fails with [`TalkbackError::DeviceUnavailable`] when the session has none.
    pub fn play(&self, audio: &NormalizedAudio) -> Result<()> {
        let sink = lock(&self.orchestrator)
            .playback()
            .cloned()
            .ok_or_else(|| TalkbackError::DeviceUnavailable {
                device: "no output device".to_string(),
            })?;
        sink.play(audio)
    }

    /// Starts listening on the device and running turns on a background thread.
    ///
    /// Fails with [`TalkbackError::DeviceUnavailable`] when the device cannot
    /// be opened, and with [`TalkbackError::DeviceBusy`] while another live
    /// session is running.
    pub fn start_live_session(&self) -> Result<LiveSessionHandle> {
        let factory = self
            .source_factory
            .clone()
            .ok_or_else(|| TalkbackError::DeviceUnavailable {
                device: "no input device configured".to_string(),
            })?;

        if self
            .live
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TalkbackError::DeviceBusy {
                device: "live session".to_string(),
                activity: "recording".to_string(),
            });
        }

        let opened = factory().and_then(|mut source| {
            let (tx, rx) = bounded(self.settings.channel_capacity);
            source.start(tx)?;
            Ok((source, rx))
        });
        let (source, first_frames) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.live.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        tracing::info!(device = source.name(), "live session started");

        let cancel = Arc::new(AtomicBool::new(false));
        let last = Arc::new(Mutex::new(None));
        let (results_tx, results_rx) = bounded(defaults::RESULTS_CAPACITY);
        let playback = lock(&self.orchestrator).playback().cloned();

        let worker = LiveWorker {
            source,
            first_frames: Some(first_frames),
            orchestrator: Arc::clone(&self.orchestrator),
            artifacts: Arc::clone(&self.artifacts),
            settings: self.settings.clone(),
            cancel: Arc::clone(&cancel),
            last: Arc::clone(&last),
            results: results_tx,
            live: Arc::clone(&self.live),
        };
        let live = Arc::clone(&self.live);
        let thread = std::thread::Builder::new()
            .name("live-session".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                live.store(false, Ordering::SeqCst);
                TalkbackError::AudioCapture {
                    message: format!("failed to spawn session thread: {e}"),
                }
            })?;

        Ok(LiveSessionHandle {
            cancel,
            last,
            results: results_rx,
            playback,
            thread: Some(thread),
            stop_timeout: self.settings.stop_timeout,
        })
    }
}

/// State moved onto the live-session thread.
struct LiveWorker {
    source: Box<dyn AudioDeviceSource>,
    first_frames: Option<Receiver<AudioFrame>>,
    orchestrator: Arc<Mutex<ConversationOrchestrator>>,
    artifacts: Arc<ArtifactStore>,
    settings: SessionSettings,
    cancel: Arc<AtomicBool>,
    last: Arc<Mutex<Option<TurnResult>>>,
    results: crossbeam_channel::Sender<TurnResult>,
    live: Arc<AtomicBool>,
}

impl LiveWorker {
    fn next_frames(&mut self) -> Result<Receiver<AudioFrame>> {
        if let Some(frames) = self.first_frames.take() {
            return Ok(frames);
        }
        let (tx, rx) = bounded(self.settings.channel_capacity);
        self.source.start(tx)?;
        Ok(rx)
    }

    fn publish(&self, result: TurnResult) {
        match self.results.try_send(result.clone()) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("turn result dropped, consumer is not reading results");
            }
        }
        if let Ok(mut last) = self.last.lock() {
            *last = Some(result);
        }
    }

    fn run(mut self) {
        let mut detector = SegmentDetector::new(self.settings.segmenter);
        let mut turns = 0u64;

        while !self.cancel.load(Ordering::SeqCst) {
            let frames = match self.next_frames() {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::error!(error = %e, "cannot restart input device");
                    self.publish(TurnResult::without_artifact(TurnOutcome::Failed {
                        stage: TurnStage::AwaitingInput,
                        reason: e.to_string(),
                    }));
                    break;
                }
            };

            let segment = detector.capture(&frames, &self.cancel, self.settings.poll);
            if let Err(e) = self.source.stop() {
                tracing::warn!(error = %e, "failed to stop input device");
            }
            drop(frames);

            let input_closed = segment.input_closed;
            let cancelled = self.cancel.load(Ordering::SeqCst);
            tracing::debug!(
                end_state = ?segment.end_state,
                input_closed,
                cancelled,
                dropped_frames = self.source.dropped_frames(),
                "recording ended"
            );

            match segment.outcome {
                SegmentOutcome::NoSpeechDetected => {}
                SegmentOutcome::Utterance(audio) => {
                    let result =
                        run_and_store(&self.orchestrator, &self.artifacts, audio, &self.cancel);
                    turns += 1;
                    let exit = result.is_exit();
                    self.publish(result);
                    if exit {
                        break;
                    }
                }
            }

            if input_closed || cancelled {
                break;
            }
        }

        if let Err(e) = self.source.stop() {
            tracing::warn!(error = %e, "failed to stop input device");
        }
        self.live.store(false, Ordering::SeqCst);
        tracing::info!(turns, "live session ended");
    }
}

/// Control over a running live session.
pub struct LiveSessionHandle {
    cancel: Arc<AtomicBool>,
    last: Arc<Mutex<Option<TurnResult>>>,
    results: Receiver<TurnResult>,
    playback: Option<Arc<dyn PlaybackSink>>,
    thread: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl LiveSessionHandle {
    /// Every turn result, in order.
    pub fn results(&self) -> &Receiver<TurnResult> {
        &self.results
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Flag that stops the session when raised, for signal handlers.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Stops the session and returns the last turn's result.
    ///
    /// A recording in progress ends as timed out and its utterance still
    /// gets a turn. Waits up to the configured stop timeout for that turn,
    /// then detaches the thread.
    pub fn stop(mut self) -> Option<TurnResult> {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(playback) = &self.playback {
            playback.stop();
        }
        self.join(self.stop_timeout);
        self.last_result()
    }

    /// Waits for the session to end by itself (exit phrase or end of input).
    pub fn wait(mut self) -> Option<TurnResult> {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("live session thread panicked");
        }
        self.last_result()
    }

    fn last_result(&self) -> Option<TurnResult> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    fn join(&mut self, timeout: Duration) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let deadline = Instant::now() + timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("live session did not stop in time, detaching");
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if thread.join().is_err() {
            tracing::error!("live session thread panicked");
        }
    }
}

impl Drop for LiveSessionHandle {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

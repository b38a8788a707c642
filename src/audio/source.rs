//! Frame producers.
//!
//! A device source pushes fixed-size mono frames into a bounded channel from
//! its own thread. Pushing never blocks: when the consumer falls behind, the
//! frame is dropped and counted.

use crate::audio::frame::{AudioFrame, NormalizedAudio};
use crate::defaults;
use crate::error::{Result, TalkbackError};
use crossbeam_channel::{Sender, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Trait for audio input devices.
///
/// This trait allows swapping implementations (real audio device vs mock).
pub trait AudioDeviceSource: Send {
    /// Device name, for logs and errors.
    fn name(&self) -> &str;

    /// Starts emitting frames into `frames`.
    ///
    /// Fails with [`TalkbackError::DeviceBusy`] if the source is already
    /// running; a second recording is rejected, not queued.
    fn start(&mut self, frames: Sender<AudioFrame>) -> Result<()>;

    /// Stops emitting frames. Stopping an idle source is a no-op.
    fn stop(&mut self) -> Result<()>;

    fn is_active(&self) -> bool;

    /// Frames dropped because the channel was full.
    fn dropped_frames(&self) -> u64;
}

/// Cuts arbitrary sample chunks into fixed-length frames and hands them off.
///
/// Runs inside the device callback, so it only copies and `try_send`s.
pub struct FrameAssembler {
    frame_len: usize,
    pending: Vec<f32>,
    sequence: u64,
    frames: Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
    closed: bool,
}

impl FrameAssembler {
    pub fn new(frame_len: usize, frames: Sender<AudioFrame>, dropped: Arc<AtomicU64>) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
            sequence: 0,
            frames,
            dropped,
            closed: false,
        }
    }

    /// Appends mono samples, sending every complete frame.
    pub fn push(&mut self, samples: &[f32]) {
        if self.closed {
            return;
        }
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.frame_len {
            let chunk: Vec<f32> = self.pending.drain(..self.frame_len).collect();
            let frame = AudioFrame::new(chunk, self.sequence, Instant::now());
            self.sequence += 1;
            match self.frames.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.closed = true;
                    self.pending.clear();
                    return;
                }
            }
        }
    }

    /// True once the consumer hung up.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn frames_emitted(&self) -> u64 {
        self.sequence
    }
}

/// Source that plays back a prepared buffer as if it came from a device.
///
/// Frames are emitted on a background thread, optionally paced in real time.
/// Each `start` resumes where the previous run stopped. When the buffer runs
/// out the sender is dropped, so the consumer sees the channel close.
pub struct BufferedSource {
    name: String,
    audio: NormalizedAudio,
    frame_len: usize,
    pacing: Option<Duration>,
    fail_start: bool,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    /// Samples already handed to a consumer.
    position: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

impl BufferedSource {
    pub fn new(audio: NormalizedAudio) -> Self {
        Self {
            name: "buffer".to_string(),
            audio,
            frame_len: defaults::FRAME_SAMPLES,
            pacing: None,
            fail_start: false,
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            position: Arc::new(AtomicUsize::new(0)),
            worker: None,
        }
    }

    pub fn with_frame_len(mut self, frame_len: usize) -> Self {
        self.frame_len = frame_len.max(1);
        self
    }

    /// Sleep this long between frames.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = Some(pacing);
        self
    }

    /// Make `start` fail as if the device could not be opened.
    pub fn with_start_failure(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

impl AudioDeviceSource for BufferedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, frames: Sender<AudioFrame>) -> Result<()> {
        if self.fail_start {
            return Err(TalkbackError::DeviceUnavailable {
                device: self.name.clone(),
            });
        }
        if self.is_active() {
            return Err(TalkbackError::DeviceBusy {
                device: self.name.clone(),
                activity: "recording".to_string(),
            });
        }
        // reap a worker that ran to completion
        if let Some(worker) = self.worker.take() {
            join_worker(worker, &self.name);
        }

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let dropped = Arc::clone(&self.dropped);
        let position = Arc::clone(&self.position);
        let start = position.load(Ordering::SeqCst).min(self.audio.len());
        let samples = self.audio.samples()[start..].to_vec();
        let frame_len = self.frame_len;
        let pacing = self.pacing;

        let worker = std::thread::Builder::new()
            .name(format!("source-{}", self.name))
            .spawn(move || {
                let mut assembler = FrameAssembler::new(frame_len, frames, dropped);
                for chunk in samples.chunks(frame_len) {
                    if !running.load(Ordering::SeqCst) || assembler.is_closed() {
                        break;
                    }
                    assembler.push(chunk);
                    position.fetch_add(chunk.len(), Ordering::SeqCst);
                    if let Some(pacing) = pacing {
                        std::thread::sleep(pacing);
                    }
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| TalkbackError::AudioCapture {
                message: format!("failed to spawn source thread: {e}"),
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        match self.worker.take().map(|worker| join_worker(worker, &self.name)) {
            Some(false) => Err(TalkbackError::AudioCapture {
                message: format!("source {} worker panicked", self.name),
            }),
            _ => Ok(()),
        }
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for BufferedSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "failed to stop source on drop");
        }
    }
}

/// Joins a producer thread; false if it panicked.
fn join_worker(worker: JoinHandle<()>, source: &str) -> bool {
    if worker.join().is_err() {
        tracing::error!(source, "source worker panicked");
        return false;
    }
    true
}

//! Speaker output.

use crate::audio::frame::NormalizedAudio;
use crate::error::{Result, TalkbackError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Plays sample buffers, one at a time.
pub trait PlaybackSink: Send + Sync {
    /// Plays `audio`, blocking until it finishes or [`stop`](Self::stop) is called.
    ///
    /// Fails with [`TalkbackError::DeviceBusy`] while another playback is running.
    fn play(&self, audio: &NormalizedAudio) -> Result<()>;

    /// Interrupts the current playback, if any. Best effort.
    fn stop(&self);

    fn is_busy(&self) -> bool;
}

/// Exclusive-use flag for one output device.
#[derive(Debug, Default)]
pub struct BusyFlag {
    busy: AtomicBool,
}

impl BusyFlag {
    /// Claims the device, or fails with `DeviceBusy` if it is already claimed.
    pub fn acquire<'a>(&'a self, device: &str) -> Result<BusyGuard<'a>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TalkbackError::DeviceBusy {
                device: device.to_string(),
                activity: "playing".to_string(),
            })?;
        Ok(BusyGuard { flag: self })
    }

    pub fn is_set(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Releases the device when dropped.
pub struct BusyGuard<'a> {
    flag: &'a BusyFlag,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.busy.store(false, Ordering::SeqCst);
    }
}

/// Sink that records what it was asked to play.
///
/// "Plays" by sleeping for `with_play_time`, or not at all, and can be stopped
/// early like a real device.
#[derive(Debug, Clone, Default)]
pub struct MockPlaybackSink {
    busy: Arc<BusyFlag>,
    interrupted: Arc<AtomicBool>,
    played: Arc<Mutex<Vec<NormalizedAudio>>>,
    play_time: Duration,
    should_fail: bool,
}

impl MockPlaybackSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block for this long on every play.
    pub fn with_play_time(mut self, play_time: Duration) -> Self {
        self.play_time = play_time;
        self
    }

    /// Fail every play as if the device disappeared.
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Buffers played so far, in order.
    pub fn played(&self) -> Vec<NormalizedAudio> {
        self.played.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl PlaybackSink for MockPlaybackSink {
    fn play(&self, audio: &NormalizedAudio) -> Result<()> {
        if self.busy.is_set() {
            return Err(TalkbackError::DeviceBusy {
                device: "mock".to_string(),
                activity: "playing".to_string(),
            });
        }
        let _guard = self.busy.acquire("mock")?;
        self.interrupted.store(false, Ordering::SeqCst);
        if self.should_fail {
            return Err(TalkbackError::Playback {
                message: "mock output device failure".to_string(),
            });
        }

        let step = Duration::from_millis(5);
        let mut waited = Duration::ZERO;
        while waited < self.play_time && !self.interrupted.load(Ordering::SeqCst) {
            std::thread::sleep(step);
            waited += step;
        }

        if let Ok(mut played) = self.played.lock() {
            played.push(audio.clone());
        }
        Ok(())
    }

    fn stop(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn is_busy(&self) -> bool {
        self.busy.is_set()
    }
}

#[cfg(feature = "cpal-audio")]
pub use cpal_sink::CpalPlaybackSink;

#[cfg(feature = "cpal-audio")]
mod cpal_sink {
    use super::{BusyFlag, PlaybackSink};
    use crate::audio::capture::with_suppressed_stderr;
    use crate::audio::frame::NormalizedAudio;
    use crate::audio::wav::resample;
    use crate::error::{Result, TalkbackError};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Extra time allowed past the buffer length before giving up on the device.
    const DRAIN_GRACE: Duration = Duration::from_millis(500);

    /// Plays through the default output device.
    pub struct CpalPlaybackSink {
        device: cpal::Device,
        name: String,
        busy: BusyFlag,
        interrupted: Arc<AtomicBool>,
    }

    impl CpalPlaybackSink {
        pub fn new() -> Result<Self> {
            let device = with_suppressed_stderr(|| cpal::default_host().default_output_device())
                .ok_or_else(|| TalkbackError::DeviceUnavailable {
                    device: "default output".to_string(),
                })?;
            let name = device.name().unwrap_or_else(|_| "default output".to_string());
            Ok(Self {
                device,
                name,
                busy: BusyFlag::default(),
                interrupted: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    impl PlaybackSink for CpalPlaybackSink {
        fn play(&self, audio: &NormalizedAudio) -> Result<()> {
            if self.busy.is_set() {
                return Err(TalkbackError::DeviceBusy {
                    device: self.name.clone(),
                    activity: "playing".to_string(),
                });
            }
            let _guard = self.busy.acquire(&self.name)?;
            self.interrupted.store(false, Ordering::SeqCst);
            if audio.is_empty() {
                return Ok(());
            }

            let config = self
                .device
                .default_output_config()
                .map_err(|e| TalkbackError::Playback {
                    message: format!("no usable output config: {e}"),
                })?;
            let device_rate = config.sample_rate().0;
            let channels = usize::from(config.channels());
            let stream_config: cpal::StreamConfig = config.into();

            let samples: Arc<Vec<f32>> =
                Arc::new(resample(audio.samples(), audio.sample_rate(), device_rate));
            let position = Arc::new(AtomicUsize::new(0));
            let finished = Arc::new(AtomicBool::new(false));

            let stream = {
                let samples = Arc::clone(&samples);
                let position = Arc::clone(&position);
                let finished = Arc::clone(&finished);
                self.device
                    .build_output_stream(
                        &stream_config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let mut pos = position.load(Ordering::Relaxed);
                            for frame in data.chunks_mut(channels) {
                                let sample = samples.get(pos).copied().unwrap_or(0.0);
                                frame.fill(sample);
                                if pos < samples.len() {
                                    pos += 1;
                                }
                            }
                            position.store(pos, Ordering::Relaxed);
                            if pos >= samples.len() {
                                finished.store(true, Ordering::SeqCst);
                            }
                        },
                        |err| {
                            tracing::error!(error = %err, "audio playback error");
                        },
                        None,
                    )
                    .map_err(|e| TalkbackError::Playback {
                        message: e.to_string(),
                    })?
            };
            stream.play().map_err(|e| TalkbackError::Playback {
                message: e.to_string(),
            })?;

            let deadline = Instant::now() + audio.duration() + DRAIN_GRACE;
            while !finished.load(Ordering::SeqCst) && !self.interrupted.load(Ordering::SeqCst) {
                if Instant::now() >= deadline {
                    tracing::warn!(device = %self.name, "playback did not drain before deadline");
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            drop(stream);
            Ok(())
        }

        fn stop(&self) {
            self.interrupted.store(true, Ordering::SeqCst);
        }

        fn is_busy(&self) -> bool {
            self.busy.is_set()
        }
    }
}

//! Microphone capture using CPAL (Cross-Platform Audio Library).

use crate::audio::frame::AudioFrame;
use crate::audio::source::{AudioDeviceSource, FrameAssembler};
use crate::audio::wav::{downmix, resample};
use crate::error::{Result, TalkbackError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// This suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers
/// when probing audio backends.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
pub(crate) fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Suppress JACK/ALSA chatter during backend probing.
///
/// # Safety
/// Modifies environment variables; call at startup before spawning threads.
pub fn suppress_audio_warnings() {
    // SAFETY: Called at startup before any threads are spawned
    unsafe {
        std::env::set_var("JACK_NO_START_SERVER", "1");
        std::env::set_var("JACK_NO_AUDIO_RESERVATION", "1");
        std::env::set_var("PIPEWIRE_DEBUG", "0");
        std::env::set_var("ALSA_DEBUG", "0");
        std::env::set_var("PW_LOG", "0");
    }
}

/// Preferred device names for PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns that are never useful for voice input.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// Lists usable input devices; preferred ones are marked `[recommended]`.
pub fn list_devices() -> Result<Vec<String>> {
    // host stays alive while the devices are iterated
    let (_host, devices) = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices();
        (host, devices)
    });
    let devices = devices.map_err(|e| TalkbackError::AudioCapture {
        message: format!("Failed to enumerate input devices: {e}"),
    })?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_preferred_device(&name) {
                device_names.push(format!("{name} [recommended]"));
            } else {
                device_names.push(name);
            }
        }
    }

    Ok(device_names)
}

/// Best default input device, preferring PipeWire/PulseAudio over the system default.
fn get_best_default_device() -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();

        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name()
                    && is_preferred_device(&name)
                {
                    return Ok(device);
                }
            }
        }

        host.default_input_device()
            .ok_or_else(|| TalkbackError::DeviceUnavailable {
                device: "default".to_string(),
            })
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is created, paused and dropped by the owner of the
/// `CpalAudioSource`, never concurrently.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Live microphone source.
///
/// Opens the device at its native configuration and converts every callback
/// buffer to mono at the pipeline rate before framing it.
pub struct CpalAudioSource {
    device: cpal::Device,
    name: String,
    stream: Option<SendableStream>,
    dropped: Arc<AtomicU64>,
    sample_rate: u32,
    frame_len: usize,
}

impl CpalAudioSource {
    /// Opens the named input device, or the best default one.
    ///
    /// Fails with [`TalkbackError::DeviceUnavailable`] when nothing matches.
    pub fn new(device_name: Option<&str>, sample_rate: u32, frame_len: usize) -> Result<Self> {
        let device = with_suppressed_stderr(|| {
            let host = cpal::default_host();

            if let Some(name) = device_name {
                let devices = host
                    .input_devices()
                    .map_err(|e| TalkbackError::AudioCapture {
                        message: format!("Failed to enumerate devices: {e}"),
                    })?;

                let mut found_device = None;
                for dev in devices {
                    if let Ok(dev_name) = dev.name()
                        && dev_name == name
                    {
                        found_device = Some(dev);
                        break;
                    }
                }

                found_device.ok_or_else(|| TalkbackError::DeviceUnavailable {
                    device: name.to_string(),
                })
            } else {
                get_best_default_device()
            }
        })?;
        let name = device.name().unwrap_or_else(|_| "default".to_string());

        Ok(Self {
            device,
            name,
            stream: None,
            dropped: Arc::new(AtomicU64::new(0)),
            sample_rate,
            frame_len,
        })
    }

    fn build_stream(&self, frames: Sender<AudioFrame>) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            self.device
                .default_input_config()
                .map_err(|e| TalkbackError::DeviceUnavailable {
                    device: format!("{} ({e})", self.name),
                })?;

        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels();
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        tracing::debug!(
            device = %self.name,
            channels = native_channels,
            sample_rate = native_rate,
            format = ?default_config.sample_format(),
            "opening input stream"
        );

        let err_callback = |err| {
            tracing::error!(error = %err, "audio input stream error");
        };

        let mut assembler = FrameAssembler::new(self.frame_len, frames, Arc::clone(&self.dropped));

        let stream = match default_config.sample_format() {
            SampleFormat::F32 => self.device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = to_pipeline_mono(data, native_channels, native_rate, target_rate);
                    assembler.push(&mono);
                },
                err_callback,
                None,
            ),
            SampleFormat::I16 => self.device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let floats: Vec<f32> = data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                    let mono = to_pipeline_mono(&floats, native_channels, native_rate, target_rate);
                    assembler.push(&mono);
                },
                err_callback,
                None,
            ),
            fmt => {
                return Err(TalkbackError::AudioCapture {
                    message: format!(
                        "Unsupported native sample format: {fmt:?}. \
                         Try specifying a device with --device."
                    ),
                });
            }
        };

        stream.map_err(|e| TalkbackError::DeviceUnavailable {
            device: format!("{} ({e})", self.name),
        })
    }
}

/// Mix to mono and resample one callback buffer.
fn to_pipeline_mono(samples: &[f32], channels: u16, source_rate: u32, target_rate: u32) -> Vec<f32> {
    let mono = downmix(samples, channels);
    if source_rate == target_rate {
        mono
    } else {
        resample(&mono, source_rate, target_rate)
    }
}

impl AudioDeviceSource for CpalAudioSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, frames: Sender<AudioFrame>) -> Result<()> {
        if self.stream.is_some() {
            return Err(TalkbackError::DeviceBusy {
                device: self.name.clone(),
                activity: "recording".to_string(),
            });
        }

        let stream = self.build_stream(frames)?;
        stream.play().map_err(|e| TalkbackError::AudioCapture {
            message: format!("Failed to start audio stream: {e}"),
        })?;
        tracing::info!(device = %self.name, "recording started");
        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(sendable_stream) = self.stream.take() {
            sendable_stream
                .0
                .pause()
                .map_err(|e| TalkbackError::AudioCapture {
                    message: format!("Failed to stop audio stream: {e}"),
                })?;
            tracing::info!(
                device = %self.name,
                dropped_frames = self.dropped.load(Ordering::Relaxed),
                "recording stopped"
            );
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_filter_device() {
        assert!(should_filter_device("surround51"));
        assert!(should_filter_device("front:CARD=PCH"));
        assert!(should_filter_device("HDMI Output"));
        assert!(!should_filter_device("pipewire"));
        assert!(!should_filter_device("Built-in Audio"));
    }

    #[test]
    fn test_is_preferred_device() {
        assert!(is_preferred_device("PipeWire"));
        assert!(is_preferred_device("pulse"));
        assert!(!is_preferred_device("hw:0,0"));
        assert!(!is_preferred_device("default"));
    }

    #[test]
    fn test_to_pipeline_mono_downmixes_and_resamples() {
        let stereo: Vec<f32> = (0..4800).flat_map(|_| [0.5f32, 0.1]).collect();
        let mono = to_pipeline_mono(&stereo, 2, 48000, 16000);
        assert_eq!(mono.len(), 1600);
        assert!(mono.iter().all(|s| (s - 0.3).abs() < 1e-6));
    }

    #[test]
    fn test_create_with_invalid_device_name() {
        match CpalAudioSource::new(Some("NonExistentDevice12345"), 16000, 1024) {
            Err(TalkbackError::DeviceUnavailable { device }) => {
                assert_eq!(device, "NonExistentDevice12345");
            }
            Err(other) => panic!("Expected DeviceUnavailable, got {other:?}"),
            Ok(_) => panic!("Expected DeviceUnavailable"),
        }
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_list_devices_returns_at_least_one_device() {
        let devices = list_devices().unwrap();
        assert!(!devices.is_empty(), "Expected at least one audio device");
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_capture_delivers_fixed_size_frames() {
        let (tx, rx) = crossbeam_channel::bounded(64);
        let mut source = CpalAudioSource::new(None, 16000, 1024).unwrap();
        source.start(tx).unwrap();
        let frame = rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("no frame from device");
        assert_eq!(frame.samples.len(), 1024);
        source.stop().unwrap();
        assert!(!source.is_active());
    }
}

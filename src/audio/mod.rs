//! Audio capture, segmentation, normalisation and playback.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod frame;
pub mod ingest;
pub mod playback;
pub mod source;
pub mod vad;
pub mod wav;

pub use frame::{AudioFrame, NormalizedAudio};
pub use ingest::AudioIngestNormalizer;
pub use playback::{MockPlaybackSink, PlaybackSink};
pub use source::{AudioDeviceSource, BufferedSource};
pub use vad::{Segment, SegmentDetector, SegmentOutcome, SegmentState, SegmenterConfig};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use talkback::audio::wav::encode_wav;
use talkback::{AudioIngestNormalizer, NormalizedAudio, SegmentDetector, SegmenterConfig};

const RATE: u32 = 16000;

/// Speech-like buffer: leading silence, `voiced_secs` of signal, trailing silence.
fn utterance(voiced_secs: usize) -> NormalizedAudio {
    let mut samples = vec![0.0f32; RATE as usize / 2];
    samples.extend((0..RATE as usize * voiced_secs).map(|i| (i as f32 * 0.05).sin() * 0.4));
    samples.extend(vec![0.0f32; RATE as usize * 2]);
    NormalizedAudio::new(samples, RATE)
}

fn bench_segment_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_buffer");
    for secs in [1usize, 5, 20] {
        let audio = utterance(secs);
        group.bench_with_input(BenchmarkId::from_parameter(secs), &audio, |b, audio| {
            b.iter(|| {
                let mut detector = SegmentDetector::new(SegmenterConfig::default());
                black_box(detector.segment_buffer(audio, 1024))
            });
        });
    }
    group.finish();
}

fn bench_normalize_wav(c: &mut Criterion) {
    let normalizer = AudioIngestNormalizer::native_only(RATE);
    let bytes = match encode_wav(&utterance(5)) {
        Ok(bytes) => bytes,
        Err(e) => panic!("failed to encode bench input: {e}"),
    };
    c.bench_function("normalize_wav_5s", |b| {
        b.iter(|| black_box(normalizer.normalize(black_box(&bytes), Some("wav"))))
    });
}

criterion_group!(benches, bench_segment_buffer, bench_normalize_wav);
criterion_main!(benches);

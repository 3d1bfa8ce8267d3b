//! Measurement path benchmarks
//!
//! Cross-correlation refinement over typical search windows, and the onset
//! detector over one second of captured audio. The detector must stay far
//! ahead of realtime so the session loop never falls behind the device.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use speakersync::audio::click::{render_track, synthesize_click, ClickTrackConfig};
use speakersync::audio::detector::{DetectorConfig, OnsetDetector};
use speakersync::cross_correlate;

const SAMPLE_RATE: u32 = 48000;

fn bench_cross_correlate(c: &mut Criterion) {
    let mut group = c.benchmark_group("cross_correlate");
    let template = synthesize_click(1000.0, 50.0, 0.8, SAMPLE_RATE);

    // Search windows of 50, 100 and 200ms around a detection
    for window_ms in [50usize, 100, 200] {
        let len = window_ms * SAMPLE_RATE as usize / 1000;
        let mut signal = vec![0.0f32; len];
        let at = len / 3;
        for (i, s) in template.iter().enumerate() {
            if let Some(slot) = signal.get_mut(at + i) {
                *slot = *s;
            }
        }

        group.bench_function(BenchmarkId::new("window_ms", window_ms), |b| {
            b.iter(|| black_box(cross_correlate(black_box(&signal), &template, SAMPLE_RATE)));
        });
    }

    group.finish();
}

fn bench_detector(c: &mut Criterion) {
    let config = ClickTrackConfig {
        total_duration_sec: 1.0,
        ..Default::default()
    };
    let track = render_track(&config);

    c.bench_function("detector_one_second", |b| {
        b.iter(|| {
            let mut detector = OnsetDetector::new(
                SAMPLE_RATE,
                DetectorConfig {
                    noise_floor_ms: 0.0,
                    ..Default::default()
                },
                config.frequencies.clone(),
            );
            detector.start();
            for read in track.left.chunks(480) {
                black_box(detector.push_samples(read));
            }
        });
    });
}

criterion_group!(benches, bench_cross_correlate, bench_detector);
criterion_main!(benches);

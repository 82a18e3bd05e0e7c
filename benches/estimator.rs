//! Benchmarks for the ambient estimator.
//!
//! Run with: cargo bench
//!
//! The control loop refreshes the estimate every tick and calibration fits run
//! once per host, so both should stay far below a millisecond.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hearth::estimator::{fit_cooldown, CalibrationModel, CalibrationSample, CooldownPoint};

/// Synthetic ladder: R_th = 1.8 °C/W, ambient 20 °C, slight noise.
fn ladder(n: usize) -> Vec<CalibrationSample> {
    (0..n)
        .map(|i| {
            let power = 7.0 + 15.0 * i as f64 / (n - 1) as f64;
            let noise = if i % 2 == 0 { 0.3 } else { -0.3 };
            CalibrationSample::new(20.0 + 1.8 * power + noise, power, 20.0)
        })
        .collect()
}

fn cooldown(n: usize) -> Vec<CooldownPoint> {
    (0..n)
        .map(|i| {
            let t = i as f64 * 10.0;
            CooldownPoint::new(t, 20.0 + 30.0 * (-t / 400.0).exp())
        })
        .collect()
}

fn bench_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("calibration_fit");
    for n in [4usize, 8, 64] {
        let samples = ladder(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &samples, |b, samples| {
            b.iter(|| CalibrationModel::fit(black_box(samples), 4))
        });
    }
    group.finish();
}

fn bench_estimate(c: &mut Criterion) {
    let model = CalibrationModel::fit(&ladder(8), 4).expect("ladder should fit");
    c.bench_function("estimate", |b| {
        b.iter(|| model.estimate(black_box(42.0), black_box(12.5)))
    });
}

fn bench_cooldown(c: &mut Criterion) {
    let mut group = c.benchmark_group("cooldown_fit");
    for n in [5usize, 180] {
        let series = cooldown(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &series, |b, series| {
            b.iter(|| fit_cooldown(black_box(series), 20.0))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fit, bench_estimate, bench_cooldown);
criterion_main!(benches);

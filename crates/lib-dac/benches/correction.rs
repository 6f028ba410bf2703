use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lib_dac::{ChannelCorrector, ChannelOptions, CorrectionOptions, IqCorrector};
use lib_types::{Complex64, Gigahertz};
use std::f64::consts::PI;

fn gaussian_pulse(n: usize) -> Vec<Complex64> {
    (0..n)
        .map(|k| {
            let t = k as f64 - n as f64 / 2.0;
            Complex64::from_polar(0.5 * (-t * t / 25.0).exp(), -2.0 * PI * 0.1 * t)
        })
        .collect()
}

fn bench_iq_correct(c: &mut Criterion) {
    let mut corrector = IqCorrector::new("bench board");
    corrector
        .load_zero_cal(&[[5.8, 40.0, -25.0], [6.2, 45.0, -30.0]], 1)
        .unwrap();
    let signal = gaussian_pulse(1000);
    let options = CorrectionOptions::default();

    c.bench_function("iq_correct_1000", |b| {
        b.iter(|| {
            corrector
                .correct(Gigahertz(6.0), black_box(&signal), &options)
                .unwrap()
        })
    });
}

fn bench_channel_correct(c: &mut Criterion) {
    let mut corrector = ChannelCorrector::new("bench board", "A");
    let step: Vec<[f64; 2]> = (0..64)
        .map(|k| [k as f64, if k == 0 { 0.0 } else { 1.0 }])
        .collect();
    corrector
        .load_cal(&step, 0.0, None, lib_dsp::LowpassFilter::Flat)
        .unwrap();
    let signal: Vec<f64> = (0..1000)
        .map(|k| {
            let t = k as f64 - 500.0;
            0.5 * (-t * t / 25.0).exp()
        })
        .collect();
    let options = ChannelOptions::default();

    c.bench_function("channel_correct_1000", |b| {
        b.iter(|| corrector.correct(black_box(&signal), &options).unwrap())
    });
}

criterion_group!(benches, bench_iq_correct, bench_channel_correct);
criterion_main!(benches);

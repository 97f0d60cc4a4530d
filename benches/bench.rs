use criterion::{criterion_group, criterion_main, Criterion};

use trackpro_core::config::TrackingConfig;
use trackpro_core::driving_metrics::DrivingMetricsCalculator;
use trackpro_core::gps_processor::{AdaptiveScheduler, PositionSample};
use trackpro_core::raw_data;

fn load_drive() -> Vec<PositionSample> {
    raw_data::load_csv("./tests/data/drive.csv").unwrap()
}

fn scheduler(c: &mut Criterion) {
    let samples = load_drive();
    let config = TrackingConfig::default();
    c.bench_function("adaptive_scheduler", |b| {
        b.iter(|| {
            let mut scheduler = AdaptiveScheduler::new(&config);
            for sample in &samples {
                std::hint::black_box(scheduler.preprocess(sample));
            }
        });
    });
}

fn driving_metrics(c: &mut Criterion) {
    let samples = load_drive();
    let config = TrackingConfig::default();
    c.bench_function("driving_metrics", |b| {
        b.iter(|| {
            let mut calculator = DrivingMetricsCalculator::new(&config);
            for sample in &samples {
                std::hint::black_box(calculator.record(sample));
            }
        });
    });
}

criterion_group!(benches, scheduler, driving_metrics);
criterion_main!(benches);

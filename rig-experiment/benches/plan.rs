use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use pprof::criterion::{Output, PProfProfiler};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Duration;

use rig_experiment::{ItiSchedule, TrialPlan};

/// Plan generation for typical session sizes (stimuli × repeats).
pub fn bench_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_generate");
    group
        .sample_size(50)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1));

    for (k, r) in [(2, 20), (4, 50), (8, 120)] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{k}x{r}")), &(k, r), |b, &(k, r)| {
            let mut rng = StdRng::seed_from_u64(1);
            b.iter(|| TrialPlan::generate(black_box(k), black_box(r), &mut rng));
        });
    }
    group.finish();
}

pub fn bench_iti_draw(c: &mut Criterion) {
    let schedule = ItiSchedule::split_half(
        200,
        (Duration::from_secs_f64(0.8), Duration::from_secs(5)),
        (Duration::from_secs_f64(0.4), Duration::from_secs(2)),
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(2);
    let mut trial = 0;
    c.bench_function("iti_draw", |b| {
        b.iter(|| {
            trial = trial % 200 + 1;
            schedule.draw(black_box(trial), &mut rng)
        })
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .with_profiler(PProfProfiler::new(100, Output::Flamegraph(None)))
        .confidence_level(0.95)
        .noise_threshold(0.02);
    targets = bench_generate, bench_iti_draw
}

criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use detector::clock::{Clock, SystemClock, VirtualClock};
use detector::leg::Checkpoint;
use std::time::{Duration, UNIX_EPOCH};

fn bench_clock_now(c: &mut Criterion) {
    let mut group = c.benchmark_group("clock_now");
    // Small, fast functions: increase sample size for better resolution
    group.sample_size(1000);

    // VirtualClock baseline (single Mutex read, no syscalls)
    let vclk = VirtualClock::new();
    group.bench_function("virtual_clock_now", |b| b.iter(|| black_box(vclk.now())));

    let sclk = SystemClock;
    group.bench_function("system_clock_now", |b| b.iter(|| black_box(sclk.now())));

    group.finish();
}

fn bench_checkpoint_observe(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_observe");
    let period = Duration::from_millis(100);
    let margin = Duration::from_millis(10);

    group.bench_function("heartbeat", |b| {
        let mut cp = Checkpoint::new(UNIX_EPOCH, period);
        b.iter(|| {
            let now = cp.expected();
            black_box(cp.observe(now, margin))
        })
    });

    group.bench_function("one_hour_resync", |b| {
        let mut cp = Checkpoint::new(UNIX_EPOCH, period);
        b.iter(|| {
            let now = cp.expected() + Duration::from_secs(3_600);
            black_box(cp.observe(now, margin))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_clock_now, bench_checkpoint_observe);
criterion_main!(benches);

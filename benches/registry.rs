//! Registry update and exposition rendering costs.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use opmetrics::exposition::render;
use opmetrics::record::{OperationKind, OperationRecord, WorkloadKind};
use opmetrics::registry::MetricRegistry;
use std::sync::Arc;

fn sample(kind: OperationKind, driver: &str, success: bool) -> OperationRecord {
    let start = chrono::Utc::now();
    let builder = OperationRecord::builder(kind, WorkloadKind::ObjectStorage)
        .size_bytes(64 * 1024)
        .driver(driver)
        .started_at(start)
        .finished_at(start + chrono::Duration::milliseconds(12));
    if success {
        builder.build().unwrap()
    } else {
        builder.failed("SlowDown", "throttled").build().unwrap()
    }
}

fn bench_record_operation(c: &mut Criterion) {
    let registry = MetricRegistry::new().unwrap();
    let record = sample(OperationKind::Upload, "dummy", true);

    c.bench_function("record_operation", |b| {
        b.iter(|| registry.record_operation(black_box(&record)));
    });
}

fn bench_record_operation_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_operation_contended");
    for threads in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let registry = Arc::new(MetricRegistry::new().unwrap());
            let record = sample(OperationKind::Download, "dummy", true);
            b.iter(|| {
                std::thread::scope(|scope| {
                    for _ in 0..threads {
                        scope.spawn(|| {
                            for _ in 0..100 {
                                registry.record_operation(&record);
                            }
                        });
                    }
                });
            });
        });
    }
    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let registry = MetricRegistry::new().unwrap();
    for kind in OperationKind::ALL {
        for driver in ["s3", "rbd", "dummy"] {
            registry.record_operation(&sample(kind, driver, true));
            registry.record_operation(&sample(kind, driver, false));
        }
    }

    c.bench_function("render_snapshot", |b| {
        b.iter(|| black_box(render(&registry.snapshot())));
    });
}

criterion_group!(
    registry_benches,
    bench_record_operation,
    bench_record_operation_contended,
    bench_render
);
criterion_main!(registry_benches);

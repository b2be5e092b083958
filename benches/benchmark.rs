use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::FutureExt;
use legis_collector::{
    format_duration, Config, DbPage, DbPageSource, PageRequest, ResourcePool, StreamingQueue,
    WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| {
            let config = Config::default();
            black_box(config);
        });
    });

    group.finish();
}

fn benchmark_format_utilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_utilities");
    configure_fast_group(&mut group);

    group.bench_function("duration", |b| {
        b.iter(|| {
            black_box(format_duration(Duration::from_millis(3_725_500)));
        });
    });

    group.finish();
}

fn benchmark_queue_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("streaming_queue");
    configure_fast_group(&mut group);

    for (label, shared) in [("dedicated_fetch_pool", false), ("shared_pool", true)] {
        group.bench_function(label, |b| {
            b.iter(|| {
                rt.block_on(async {
                    let source = DbPageSource::with_page_size(50, |request: PageRequest| async move {
                        let ids: Vec<usize> =
                            (request.offset()..request.offset() + request.size).collect();
                        Ok(DbPage::new(ids, request.number < 19))
                    });
                    let workers = Arc::new(WorkerPool::new("bench", 4, 256).unwrap());
                    let queue = if shared {
                        StreamingQueue::shared(workers, 50, source)
                    } else {
                        StreamingQueue::new(workers, 50, source).unwrap()
                    };

                    let report = queue
                        .for_each(|id: usize| async move {
                            black_box(id);
                            Ok(())
                        })
                        .await
                        .unwrap();
                    black_box(report);
                })
            });
        });
    }

    group.finish();
}

fn benchmark_pool_borrow_return(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("resource_pool");
    configure_fast_group(&mut group);

    let pool: ResourcePool<Vec<u8>> = rt.block_on(async {
        ResourcePool::new(
            "bench",
            8,
            || async { Ok(vec![0u8; 1024]) }.boxed(),
            |_| async { Ok(()) }.boxed(),
        )
        .unwrap()
    });

    group.bench_function("borrow_return", |b| {
        b.iter(|| {
            rt.block_on(async {
                let lease = pool.borrow().await.unwrap();
                black_box(lease.len());
                pool.return_object(lease).unwrap();
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_config_creation,
    benchmark_format_utilities,
    benchmark_queue_drain,
    benchmark_pool_borrow_return,
);

criterion_main!(benches);

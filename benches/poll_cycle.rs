use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use crossbeam_channel::unbounded;
use serde_json::json;

use kyrowatch::{ChangeFilter, ChannelInvoker, InMemoryChangeStore, Namespace, WatchConfig, WatchManager};

fn bench_insert_to_delivery(c: &mut Criterion) {
    let mut group = c.benchmark_group("poll_cycle/insert_to_delivery");

    // Latency of one event grows with the number of watchers polled per cycle.
    for watchers in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(watchers), &watchers, |b, &watchers| {
            let store = Arc::new(InMemoryChangeStore::new());
            let invoker = ChannelInvoker::new();
            let (tx, rx) = unbounded();
            invoker.register("bench", tx);

            let manager = WatchManager::with_config(
                Arc::clone(&store) as Arc<dyn kyrowatch::ChangeStreamSource>,
                Arc::new(invoker),
                WatchConfig {
                    idle_interval_ms: 1,
                    ..WatchConfig::default()
                },
            );

            let target = Namespace::new("bench", "target").unwrap();
            for i in 1..watchers {
                let idle = Namespace::new("bench", format!("idle_{i}")).unwrap();
                manager.watch(idle, ChangeFilter::match_all(), "bench").unwrap();
            }
            manager.watch(target.clone(), ChangeFilter::match_all(), "bench").unwrap();

            let mut next_id = 0u64;
            b.iter_custom(|iters| {
                let start = Instant::now();
                for _ in 0..iters {
                    store.insert(&target, json!({"_id": next_id})).unwrap();
                    next_id += 1;
                    rx.recv_timeout(Duration::from_secs(5)).unwrap();
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert_to_delivery);
criterion_main!(benches);

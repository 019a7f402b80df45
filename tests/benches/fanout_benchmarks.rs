//! # Message Bus Benchmarks
//!
//! | Scenario | What it measures |
//! |----------|------------------|
//! | fan-out | one publish, N handlers on the root |
//! | deep tree | `ToChildren` publish through a random tree |
//! | re-entrant | handler that publishes a second topic |
//! | churn | connect + subscribe + disconnect cycle with compaction |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use message_bus::{BusConfig, InlineExecutor, MessageBus, Publisher, RootBus, Topic};
use rand::Rng;

trait Listener: Send + Sync {
    fn on_event(&self, payload: u64);
}

#[derive(Default)]
struct Sink(AtomicU64);

impl Listener for Sink {
    fn on_event(&self, payload: u64) {
        self.0.fetch_add(payload, Ordering::Relaxed);
    }
}

struct Forwarder {
    next: Publisher<dyn Listener>,
}

impl Listener for Forwarder {
    fn on_event(&self, payload: u64) {
        let _ = self.next.publish(|l| l.on_event(payload));
    }
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan-out");
    group.measurement_time(Duration::from_secs(5));

    for handlers in [1usize, 16, 256] {
        let root = RootBus::new();
        let topic = Topic::<dyn Listener>::new("bench");
        let conn = root.connect().expect("connect");
        let sink = Arc::new(Sink::default());
        for _ in 0..handlers {
            conn.subscribe(&topic, sink.clone() as Arc<dyn Listener>)
                .expect("subscribe");
        }
        let publisher = root.sync_publisher(&topic);

        group.throughput(Throughput::Elements(handlers as u64));
        group.bench_with_input(BenchmarkId::new("publish", handlers), &handlers, |b, _| {
            b.iter(|| publisher.publish(|l| l.on_event(black_box(1))))
        });
    }
    group.finish();
}

fn bench_deep_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("deep-tree");
    let mut rng = rand::thread_rng();

    for size in [8usize, 64, 256] {
        let root = RootBus::new();
        let topic = Topic::<dyn Listener>::new("bench");
        let sink = Arc::new(Sink::default());
        let mut nodes: Vec<MessageBus> = vec![root.bus().clone()];
        for _ in 1..size {
            let parent = nodes[rng.gen_range(0..nodes.len())].clone();
            let child = parent.create_child_unowned().expect("child");
            child
                .connect()
                .expect("connect")
                .subscribe(&topic, sink.clone() as Arc<dyn Listener>)
                .expect("subscribe");
            nodes.push(child);
        }
        let publisher = root.sync_publisher(&topic);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("to_children", size), &size, |b, _| {
            b.iter(|| publisher.publish(|l| l.on_event(black_box(1))))
        });
    }
    group.finish();
}

fn bench_reentrant(c: &mut Criterion) {
    let root = RootBus::new();
    let outer = Topic::<dyn Listener>::new("outer");
    let inner = Topic::<dyn Listener>::new("inner");
    let conn = root.connect().expect("connect");
    conn.subscribe(
        &outer,
        Arc::new(Forwarder {
            next: root.sync_publisher(&inner),
        }),
    )
    .expect("subscribe");
    conn.subscribe(&inner, Arc::new(Sink::default()) as Arc<dyn Listener>)
        .expect("subscribe");
    let publisher = root.sync_publisher(&outer);

    c.bench_function("re-entrant/publish", |b| {
        b.iter(|| publisher.publish(|l| l.on_event(black_box(1))))
    });
}

fn bench_churn(c: &mut Criterion) {
    let root = RootBus::with_executor(
        BusConfig::default().with_compaction_threshold(64),
        Arc::new(InlineExecutor),
    );
    let topic = Topic::<dyn Listener>::new("churn");
    let sink = Arc::new(Sink::default());

    c.bench_function("churn/connect_subscribe_disconnect", |b| {
        b.iter(|| {
            let conn = root.connect().expect("connect");
            conn.subscribe(&topic, sink.clone() as Arc<dyn Listener>)
                .expect("subscribe");
            conn.disconnect();
        })
    });
}

criterion_group!(benches, bench_fan_out, bench_deep_tree, bench_reentrant, bench_churn);
criterion_main!(benches);

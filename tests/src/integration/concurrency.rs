//! # Concurrent Tree Mutation
//!
//! Publishers, subscribers and structural changes racing on one tree:
//!
//! ```text
//! thread 0..N:  loop { create child | connect+subscribe | publish | dispose | disconnect }
//! main:         join all, then check the tree is consistent and quiescent
//! ```

#[cfg(test)]
mod tests {
    use crate::fixtures::{init_test_logging, Counter, EventListener};
    use message_bus::{
        BroadcastDirection, BusConfig, BusError, MessageBus, MessageBusConnection, RootBus, Topic,
    };
    use parking_lot::Mutex;
    use rand::Rng;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    const THREADS: usize = 8;
    const STEPS: usize = 300;

    struct Shared {
        root: RootBus,
        nodes: Mutex<Vec<MessageBus>>,
        connections: Mutex<Vec<MessageBusConnection>>,
        topics: [Topic<dyn EventListener>; 3],
        counter: Arc<Counter>,
    }

    fn random_node(shared: &Shared, rng: &mut impl Rng) -> MessageBus {
        let nodes = shared.nodes.lock();
        nodes[rng.gen_range(0..nodes.len())].clone()
    }

    fn step(shared: &Shared, rng: &mut impl Rng) {
        let topic = &shared.topics[rng.gen_range(0..shared.topics.len())];
        match rng.gen_range(0..10) {
            0 | 1 => {
                if let Ok(child) = random_node(shared, rng).create_child_unowned() {
                    shared.nodes.lock().push(child);
                }
            }
            2 | 3 => {
                if let Ok(conn) = random_node(shared, rng).connect() {
                    // Subscribing on a connection whose node vanished is allowed.
                    let _ = conn.subscribe(topic, shared.counter.clone() as Arc<dyn EventListener>);
                    shared.connections.lock().push(conn);
                }
            }
            4..=7 => {
                let node = random_node(shared, rng);
                let result = node.sync_publisher(topic).publish(|l| l.on_event(1));
                assert!(
                    matches!(result, Ok(()) | Err(BusError::NodeDisposed { .. })),
                    "unexpected publish result: {result:?}"
                );
            }
            8 => {
                let mut nodes = shared.nodes.lock();
                if nodes.len() > 1 {
                    let idx = rng.gen_range(1..nodes.len());
                    let victim = nodes.swap_remove(idx);
                    drop(nodes);
                    victim.dispose();
                }
            }
            _ => {
                let mut connections = shared.connections.lock();
                if !connections.is_empty() {
                    let idx = rng.gen_range(0..connections.len());
                    let conn = connections.swap_remove(idx);
                    drop(connections);
                    conn.disconnect();
                }
            }
        }
    }

    #[test]
    fn test_random_mutation_under_publish() {
        init_test_logging();
        let root = RootBus::with_config(BusConfig::default().with_compaction_threshold(16));
        let shared = Arc::new(Shared {
            nodes: Mutex::new(vec![root.bus().clone()]),
            root,
            connections: Mutex::new(Vec::new()),
            topics: [
                Topic::with_direction("down", BroadcastDirection::ToChildren),
                Topic::with_direction("up", BroadcastDirection::ToParent),
                Topic::with_direction("direct", BroadcastDirection::ToDirectChildren),
            ],
            counter: Arc::new(Counter::default()),
        });
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = shared.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    barrier.wait();
                    for _ in 0..STEPS {
                        step(&shared, &mut rng);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        // Tear down every child; only root connections may survive.
        for child in shared.root.children() {
            child.dispose();
        }
        assert_eq!(shared.root.node_count(), 1);
        for topic in &shared.topics {
            assert!(!shared.root.has_undelivered_events(topic));
        }

        let root_id = shared.root.id();
        let live_on_root = shared
            .connections
            .lock()
            .iter()
            .filter(|c| !c.is_disconnected())
            .inspect(|c| assert_eq!(c.node(), root_id))
            .count();

        shared.root.compact_now();
        assert_eq!(shared.root.connection_records(), live_on_root);

        let metrics = shared.root.metrics();
        assert_eq!(metrics.live_nodes(), 1);
        assert_eq!(metrics.deliveries, shared.counter.calls());
    }

    struct SlowListener {
        entered: AtomicU64,
    }

    impl EventListener for SlowListener {
        fn on_event(&self, _payload: u64) {
            self.entered.fetch_add(1, Ordering::SeqCst);
            thread::sleep(std::time::Duration::from_millis(2));
        }
    }

    #[test]
    fn test_subscribe_while_publishing_never_blocks_on_handlers() {
        let root = Arc::new(RootBus::new());
        let topic = Topic::<dyn EventListener>::new("T");
        let slow = Arc::new(SlowListener {
            entered: AtomicU64::new(0),
        });
        root.connect()
            .unwrap()
            .subscribe(&topic, slow.clone() as Arc<dyn EventListener>)
            .unwrap();

        let publisher = {
            let root = root.clone();
            let topic = topic.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    root.sync_publisher(&topic).publish(|l| l.on_event(0)).unwrap();
                }
            })
        };

        // Structural changes interleave with the slow handler.
        for _ in 0..50 {
            let child = root.create_child_unowned().unwrap();
            let conn = child.connect().unwrap();
            conn.subscribe(&topic, Arc::new(Counter::default()) as Arc<dyn EventListener>)
                .unwrap();
            child.dispose();
        }
        publisher.join().expect("publisher panicked");

        assert_eq!(slow.entered.load(Ordering::SeqCst), 50);
        assert_eq!(root.node_count(), 1);
    }
}

//! # Delivery Order
//!
//! Properties checked against random subscribe sequences and random trees:
//!
//! 1. **Within a node**: connect order first, then subscribe order.
//! 2. **Across nodes**: the documented walk for each broadcast direction.
//! 3. **Re-entrancy**: a nested publish finishes before the outer handler
//!    continues, and the outer fan-out still reaches later subscribers.

use message_bus::BroadcastDirection;

/// Reference walk for a tree given as parent indices (`parents[0]` is the root).
pub fn expected_reach(
    parents: &[Option<usize>],
    origin: usize,
    direction: BroadcastDirection,
) -> Vec<usize> {
    let children = |node: usize| -> Vec<usize> {
        (0..parents.len()).filter(|c| parents[*c] == Some(node)).collect()
    };
    let ancestors = |node: usize| -> Vec<usize> {
        let mut chain = vec![node];
        let mut cursor = parents[node];
        while let Some(p) = cursor {
            chain.push(p);
            cursor = parents[p];
        }
        chain
    };
    let subtree = |node: usize| -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(children(id).into_iter().rev());
        }
        out
    };

    match direction {
        BroadcastDirection::ToChildren => {
            let mut order = ancestors(origin);
            order.reverse();
            order.pop();
            order.extend(subtree(origin));
            order
        }
        BroadcastDirection::ToParent => ancestors(origin),
        BroadcastDirection::ToDirectChildren => {
            let mut order = vec![origin];
            order.extend(children(origin));
            order
        }
        BroadcastDirection::None => vec![origin],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{entries, init_test_logging, new_log, EventListener, Log, Recorder};
    use message_bus::{MessageBus, Publisher, RootBus, Topic};
    use proptest::prelude::*;
    use proptest::sample::Index;
    use std::sync::Arc;

    // =========================================================================
    // FIXTURES
    // =========================================================================

    fn build_tree(root: &RootBus, parent_picks: &[Index]) -> (Vec<MessageBus>, Vec<Option<usize>>) {
        let mut nodes = vec![root.bus().clone()];
        let mut parents = vec![None];
        for (i, pick) in parent_picks.iter().enumerate() {
            let parent = pick.index(i + 1);
            let child = nodes[parent].create_child_unowned().unwrap();
            nodes.push(child);
            parents.push(Some(parent));
        }
        (nodes, parents)
    }

    trait Outer: Send + Sync {
        fn t11(&self);
    }

    trait Inner: Send + Sync {
        fn t21(&self);
    }

    struct Named {
        name: &'static str,
        log: Log,
    }

    impl Outer for Named {
        fn t11(&self) {
            self.log.lock().push(format!("{}.t11", self.name));
        }
    }

    impl Inner for Named {
        fn t21(&self) {
            self.log.lock().push(format!("{}.t21", self.name));
        }
    }

    struct Republisher {
        log: Log,
        inner: Publisher<dyn Inner>,
    }

    impl Outer for Republisher {
        fn t11(&self) {
            self.log.lock().push("A.t11".to_string());
            self.inner.publish(|l| l.t21()).unwrap();
            self.log.lock().push("A.t11-continuation".to_string());
        }
    }

    // =========================================================================
    // SCENARIOS
    // =========================================================================

    #[test]
    fn test_reentrant_publish_across_nodes() {
        init_test_logging();
        let root = RootBus::new();
        let child = root.create_child_unowned().unwrap();
        let t1 = Topic::<dyn Outer>::new("T1");
        let t2 = Topic::<dyn Inner>::new("T2");
        let log = new_log();

        // A on the root publishes T2 from the child; C lives on the child.
        root.connect()
            .unwrap()
            .subscribe(
                &t1,
                Arc::new(Republisher {
                    log: log.clone(),
                    inner: child.sync_publisher(&t2),
                }),
            )
            .unwrap();
        child
            .connect()
            .unwrap()
            .subscribe(&t1, Arc::new(Named { name: "B", log: log.clone() }) as Arc<dyn Outer>)
            .unwrap();
        child
            .connect()
            .unwrap()
            .subscribe(&t2, Arc::new(Named { name: "C", log: log.clone() }) as Arc<dyn Inner>)
            .unwrap();

        root.sync_publisher(&t1).publish(|l| l.t11()).unwrap();

        assert_eq!(
            entries(&log),
            vec!["A.t11", "C.t21", "A.t11-continuation", "B.t11"]
        );
    }

    #[test]
    fn test_none_direction_stays_on_node() {
        let root = RootBus::new();
        let child = root.create_child_unowned().unwrap();
        let topic = Topic::<dyn EventListener>::with_direction("local", BroadcastDirection::None);
        let log = new_log();
        root.connect().unwrap().subscribe(&topic, Recorder::listener("root", &log)).unwrap();
        child.connect().unwrap().subscribe(&topic, Recorder::listener("child", &log)).unwrap();

        child.sync_publisher(&topic).publish(|l| l.on_event(1)).unwrap();
        root.sync_publisher(&topic).publish(|l| l.on_event(1)).unwrap();

        assert_eq!(entries(&log), vec!["child", "root"]);
    }

    // =========================================================================
    // PROPERTIES
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Handlers on one node run in connect order, then subscribe order,
        /// whatever order the subscribe calls were made in.
        #[test]
        fn prop_fan_out_order_within_node(picks in prop::collection::vec(0usize..4, 1..24)) {
            let root = RootBus::new();
            let topic = Topic::<dyn EventListener>::new("T");
            let log = new_log();
            let connections: Vec<_> = (0..4).map(|_| root.connect().unwrap()).collect();

            let mut expected: Vec<(usize, String)> = Vec::new();
            for (k, conn) in picks.iter().enumerate() {
                let name = format!("c{conn}-{k}");
                connections[*conn].subscribe(&topic, Recorder::listener(name.clone(), &log)).unwrap();
                expected.push((*conn, name));
            }
            expected.sort_by_key(|(conn, _)| *conn);

            root.sync_publisher(&topic).publish(|l| l.on_event(0)).unwrap();

            let expected: Vec<String> = expected.into_iter().map(|(_, name)| name).collect();
            prop_assert_eq!(entries(&log), expected);
        }

        /// Every direction visits exactly the documented nodes in the
        /// documented order on arbitrary trees.
        #[test]
        fn prop_direction_walks_match_model(
            parent_picks in prop::collection::vec(any::<Index>(), 0..10),
            origin in any::<Index>(),
            direction in prop_oneof![
                Just(BroadcastDirection::ToChildren),
                Just(BroadcastDirection::ToParent),
                Just(BroadcastDirection::ToDirectChildren),
                Just(BroadcastDirection::None),
            ],
        ) {
            let root = RootBus::new();
            let (nodes, parents) = build_tree(&root, &parent_picks);
            let topic = Topic::<dyn EventListener>::with_direction("walk", direction);
            let log = new_log();
            for (i, node) in nodes.iter().enumerate() {
                node.connect().unwrap().subscribe(&topic, Recorder::listener(format!("n{i}"), &log)).unwrap();
            }

            let origin = origin.index(nodes.len());
            nodes[origin].sync_publisher(&topic).publish(|l| l.on_event(0)).unwrap();

            let expected: Vec<String> = expected_reach(&parents, origin, direction)
                .into_iter()
                .map(|i| format!("n{i}"))
                .collect();
            prop_assert_eq!(entries(&log), expected);
        }
    }

    #[test]
    fn test_model_on_fixed_tree() {
        // 0 ─┬─ 1 ── 3
        //    └─ 2
        let parents = [None, Some(0), Some(0), Some(1)];
        assert_eq!(expected_reach(&parents, 1, BroadcastDirection::ToChildren), vec![0, 1, 3]);
        assert_eq!(expected_reach(&parents, 3, BroadcastDirection::ToParent), vec![3, 1, 0]);
        assert_eq!(expected_reach(&parents, 0, BroadcastDirection::ToDirectChildren), vec![0, 1, 2]);
    }
}

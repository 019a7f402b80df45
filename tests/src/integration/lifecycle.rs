//! # Lifecycle Scenarios
//!
//! Scope ownership of nodes and connections, plugin unload while a publish is
//! in flight, and telemetry export of the resulting counters.

#[cfg(test)]
mod tests {
    use crate::fixtures::{entries, init_test_logging, new_log, Counter, EventListener, Recorder};
    use bus_telemetry::BusMetricsExporter;
    use message_bus::{BusError, DisposalScope, RootBus, Scope, Topic};
    use std::sync::Arc;

    // =========================================================================
    // SCOPES
    // =========================================================================

    #[test]
    fn test_application_disposal_tears_down_everything() {
        init_test_logging();
        let root = RootBus::new();
        let application = Scope::new("application");
        let project = application.child("project");
        let editor = project.child("editor");
        let topic = Topic::<dyn EventListener>::new("T");
        let log = new_log();

        let project_bus = root.create_child(&project).unwrap();
        let module_bus = project_bus.create_child(&project).unwrap();
        let editor_conn = project_bus.connect_with(&editor).unwrap();
        editor_conn.subscribe(&topic, Recorder::listener("editor", &log)).unwrap();
        let module_conn = module_bus.connect().unwrap();
        module_conn.subscribe(&topic, Recorder::listener("module", &log)).unwrap();

        root.sync_publisher(&topic).publish(|l| l.on_event(1)).unwrap();
        assert_eq!(entries(&log), vec!["editor", "module"]);

        application.dispose();

        assert!(project.is_disposed() && editor.is_disposed());
        assert!(project_bus.is_disposed() && module_bus.is_disposed());
        assert!(editor_conn.is_disconnected() && module_conn.is_disconnected());
        assert!(root.children().is_empty());
        assert_eq!(root.node_count(), 1);

        root.sync_publisher(&topic).publish(|l| l.on_event(2)).unwrap();
        assert_eq!(entries(&log).len(), 2);
    }

    #[test]
    fn test_owner_scope_already_disposed() {
        let root = RootBus::new();
        let scope = Scope::new("closed project");
        scope.dispose();

        assert!(matches!(root.create_child(&scope), Err(BusError::ScopeDisposed { .. })));
        assert!(root.children().is_empty());
    }

    #[test]
    fn test_dropping_handle_keeps_subscription() {
        let root = RootBus::new();
        let topic = Topic::<dyn EventListener>::new("T");
        let counter = Arc::new(Counter::default());
        {
            let conn = root.connect().unwrap();
            conn.subscribe(&topic, counter.clone() as Arc<dyn EventListener>).unwrap();
        }

        root.sync_publisher(&topic).publish(|l| l.on_event(5)).unwrap();

        assert_eq!(counter.calls(), 1);
        assert_eq!(counter.total(), 5);
    }

    #[test]
    fn test_disposed_node_rejects_everything() {
        let root = RootBus::new();
        let child = root.create_child_unowned().unwrap();
        let topic = Topic::<dyn EventListener>::new("T");
        child.dispose();

        assert!(matches!(child.connect(), Err(BusError::NodeDisposed { node }) if node == child.id()));
        assert!(matches!(child.create_child_unowned(), Err(BusError::NodeDisposed { .. })));
        assert!(matches!(
            child.sync_publisher(&topic).publish(|l| l.on_event(0)),
            Err(BusError::NodeDisposed { .. })
        ));
        assert!(!child.has_undelivered_events(&topic));
        assert!(child.parent().is_none());
    }

    // =========================================================================
    // PLUGIN UNLOAD
    // =========================================================================

    struct Unloader {
        root: Arc<RootBus>,
        plugin: &'static str,
    }

    impl EventListener for Unloader {
        fn on_event(&self, _payload: u64) {
            self.root
                .disconnect_plugin_connections(|id| id.as_str() == self.plugin);
        }
    }

    #[test]
    fn test_unload_during_dispatch_skips_unreached_plugin_handlers() {
        let root = Arc::new(RootBus::new());
        let project = root.create_child_unowned().unwrap();
        let topic = Topic::<dyn EventListener>::new("T");
        let log = new_log();

        root.connect()
            .unwrap()
            .subscribe(
                &topic,
                Arc::new(Unloader {
                    root: root.clone(),
                    plugin: "vcs",
                }),
            )
            .unwrap();
        let plugin_conn = project.connect_in_group("vcs").unwrap();
        plugin_conn.subscribe(&topic, Recorder::listener("vcs", &log)).unwrap();
        project
            .connect()
            .unwrap()
            .subscribe(&topic, Recorder::listener("core", &log))
            .unwrap();

        root.sync_publisher(&topic).publish(|l| l.on_event(0)).unwrap();

        assert_eq!(entries(&log), vec!["core"]);
        assert!(plugin_conn.is_disconnected());
        assert_eq!(root.metrics().plugin_subscriptions_removed, 1);
    }

    #[test]
    fn test_unload_with_no_matches_is_noop() {
        let root = RootBus::new();
        let topic = Topic::<dyn EventListener>::new("T");
        let log = new_log();
        let conn = root.connect_in_group("kept").unwrap();
        conn.subscribe(&topic, Recorder::listener("kept", &log)).unwrap();

        assert_eq!(root.disconnect_plugin_connections(|id| id.as_str() == "other"), 0);
        assert!(!conn.is_disconnected());
        assert_eq!(conn.subscription_count(), 1);
    }

    // =========================================================================
    // TELEMETRY
    // =========================================================================

    #[test]
    fn test_exporter_mirrors_bus_counters() {
        bus_telemetry::register_metrics().unwrap();
        let root = RootBus::new();
        let exporter = BusMetricsExporter::new("lifecycle-export");
        let topic = Topic::<dyn EventListener>::new("T");
        let counter = Arc::new(Counter::default());
        let conn = root.connect().unwrap();
        conn.subscribe(&topic, counter.clone() as Arc<dyn EventListener>).unwrap();

        let publisher = root.sync_publisher(&topic);
        for i in 0..3 {
            publisher.publish(|l| l.on_event(i)).unwrap();
        }
        conn.disconnect();
        exporter.record(&root.metrics());
        bus_telemetry::log_snapshot(exporter.bus(), &root.metrics());

        assert_eq!(exporter.event_count("messages_published"), 3);
        assert_eq!(exporter.event_count("deliveries"), 3);
        assert_eq!(exporter.event_count("connections_disconnected"), 1);
        assert!(bus_telemetry::encode_metrics()
            .unwrap()
            .contains("lifecycle-export"));
    }
}

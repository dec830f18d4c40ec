//! ServiceStore 行为测试

use flare_discovery::{ServiceInstance, ServiceStatus, ServiceStore, StoreAction};
use std::sync::Arc;
use std::sync::Mutex;

fn instance(service: &str, id: &str, port: u16) -> ServiceInstance {
    ServiceInstance::new(service, id, "10.0.0.1", port)
}

#[test]
fn test_add_and_remove_reflects_net_set() {
    let store = ServiceStore::new();

    store.add_service("orders", instance("orders", "orders-1", 8080));
    store.add_service("orders", instance("orders", "orders-2", 8081));
    store.add_service("orders", instance("orders", "orders-3", 8082));
    store.remove_service_node("orders", "orders-2");

    let nodes = store.service_nodes("orders", false);
    let ids: Vec<&str> = nodes.iter().map(|n| n.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["orders-1", "orders-3"]);
}

#[test]
fn test_upsert_keeps_instance_ids_unique() {
    let store = ServiceStore::new();

    store.add_service("orders", instance("orders", "orders-1", 8080));
    // 同一 instance_id 再次加入是更新，不是追加
    store.add_service("orders", instance("orders", "orders-1", 9090));

    let nodes = store.service_nodes("orders", false);
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].port, 9090);
}

#[test]
fn test_set_services_replaces_atomically() {
    let store = ServiceStore::new();

    store.add_service("orders", instance("orders", "orders-1", 8080));
    store.set_services(
        "orders",
        vec![
            instance("orders", "orders-2", 8081),
            instance("orders", "orders-3", 8082),
        ],
    );

    let nodes = store.service_nodes("orders", false);
    let ids: Vec<&str> = nodes.iter().map(|n| n.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["orders-2", "orders-3"]);
}

#[test]
fn test_removing_last_instance_removes_service_name() {
    let store = ServiceStore::new();

    store.add_service("orders", instance("orders", "orders-1", 8080));
    assert_eq!(store.service_names(), vec!["orders".to_string()]);

    store.remove_service_node("orders", "orders-1");
    assert!(store.service_names().is_empty());
    assert!(!store.has_service("orders"));
}

#[test]
fn test_remove_unknown_is_noop() {
    let store = ServiceStore::new();
    store.add_service("orders", instance("orders", "orders-1", 8080));

    store.remove_service_node("billing", "billing-1");
    store.remove_service_node("orders", "orders-42");

    assert_eq!(store.service_nodes("orders", false).len(), 1);
}

#[test]
fn test_only_passing_filter() {
    let store = ServiceStore::new();

    store.set_services(
        "orders",
        vec![
            instance("orders", "orders-1", 8080).with_status(ServiceStatus::Passing),
            instance("orders", "orders-2", 8081).with_status(ServiceStatus::Critical),
            instance("orders", "orders-3", 8082).with_status(ServiceStatus::Warning),
        ],
    );

    let all = store.service_nodes("orders", false);
    assert_eq!(all.len(), 3);

    let passing = store.service_nodes("orders", true);
    assert_eq!(passing.len(), 1);
    assert_eq!(passing[0].instance_id, "orders-1");
}

#[test]
fn test_watch_emits_added_and_removed_events() {
    let store = ServiceStore::new();
    let events: Arc<Mutex<Vec<(StoreAction, String, usize)>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = events.clone();
    store.watch(move |action, name, affected| {
        sink.lock()
            .unwrap()
            .push((action, name.to_string(), affected.len()));
    });

    store.add_service("orders", instance("orders", "orders-1", 8080));
    store.set_services(
        "orders",
        vec![
            instance("orders", "orders-1", 8080),
            instance("orders", "orders-2", 8081),
        ],
    );
    store.remove_service_node("orders", "orders-1");
    store.remove_service("orders");

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            (StoreAction::Added, "orders".to_string(), 1),
            (StoreAction::Added, "orders".to_string(), 2),
            (StoreAction::Removed, "orders".to_string(), 1),
            (StoreAction::Removed, "orders".to_string(), 1),
        ]
    );
}

#[test]
fn test_close_detaches_watchers() {
    let store = ServiceStore::new();
    let events: Arc<Mutex<Vec<StoreAction>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = events.clone();
    store.watch(move |action, _, _| sink.lock().unwrap().push(action));

    store.close();
    store.add_service("orders", instance("orders", "orders-1", 8080));

    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn test_empty_instance_list_keeps_service_known() {
    let store = ServiceStore::new();

    // 零实例的服务是合法状态
    store.set_services("orders", vec![]);
    assert!(store.has_service("orders"));
    assert!(store.service_nodes("orders", false).is_empty());
}

#[test]
fn test_reset_clears_everything() {
    let store = ServiceStore::new();
    store.add_service("orders", instance("orders", "orders-1", 8080));
    store.add_service("billing", instance("billing", "billing-1", 8090));

    store.reset();
    assert!(store.service_names().is_empty());
}

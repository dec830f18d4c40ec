//! 负载均衡客户端与选择策略测试

use flare_discovery::{
    DiscoveryError, ExecuteError, LoadBalancerClient, LoadBalancerOptions, ServiceInstance,
    ServiceStatus, ServiceStore, StrategyRegistry,
};
use std::collections::HashMap;
use std::sync::Arc;

fn instance(service: &str, id: &str, host: &str, port: u16) -> ServiceInstance {
    ServiceInstance::new(service, id, host, port)
}

fn client_with_store() -> (Arc<ServiceStore>, LoadBalancerClient) {
    let store = Arc::new(ServiceStore::new());
    let strategies = Arc::new(StrategyRegistry::with_defaults());
    let client = LoadBalancerClient::new(
        LoadBalancerOptions::default(),
        store.clone(),
        strategies,
    );
    (store, client)
}

#[tokio::test]
async fn test_choose_unknown_service_is_an_error() {
    let (_store, client) = client_with_store();

    match client.choose("orders") {
        Err(DiscoveryError::UnknownService(name)) => assert_eq!(name, "orders"),
        other => panic!("expected UnknownService, got {other:?}"),
    }
}

#[tokio::test]
async fn test_choose_on_empty_pool_returns_none() {
    let (store, client) = client_with_store();

    // 服务已知但没有实例：不是错误，返回 None
    store.set_services("orders", vec![]);
    let chosen = client.choose("orders").expect("choose should not fail");
    assert!(chosen.is_none());
}

#[tokio::test]
async fn test_choose_returns_registered_instance() {
    let (store, client) = client_with_store();

    store.set_services(
        "orders",
        vec![instance("orders", "orders-1", "10.0.0.1", 8080)],
    );

    let chosen = client
        .choose("orders")
        .expect("choose should not fail")
        .expect("one instance should be available");
    assert_eq!(chosen.instance_id, "orders-1");
    assert_eq!(chosen.host, "10.0.0.1");
    assert_eq!(chosen.port, 8080);
    assert_eq!(chosen.uri(), "http://10.0.0.1:8080");
}

#[tokio::test]
async fn test_unknown_strategy_name_is_an_error() {
    let store = Arc::new(ServiceStore::new());
    let strategies = Arc::new(StrategyRegistry::with_defaults());
    let options = LoadBalancerOptions {
        strategy: "does-not-exist".to_string(),
        services: vec![],
    };
    let client = LoadBalancerClient::new(options, store.clone(), strategies);

    store.set_services(
        "orders",
        vec![instance("orders", "orders-1", "10.0.0.1", 8080)],
    );

    match client.choose("orders") {
        Err(DiscoveryError::StrategyNotFound(name)) => assert_eq!(name, "does-not-exist"),
        other => panic!("expected StrategyNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_random_strategy_is_roughly_uniform() {
    let (store, client) = client_with_store();

    store.set_services(
        "orders",
        vec![
            instance("orders", "orders-1", "10.0.0.1", 8080),
            instance("orders", "orders-2", "10.0.0.2", 8080),
        ],
    );

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..1000 {
        let chosen = client
            .choose("orders")
            .expect("choose should not fail")
            .expect("instances are available");
        *counts.entry(chosen.instance_id).or_insert(0) += 1;
    }

    let first = counts.get("orders-1").copied().unwrap_or(0);
    let second = counts.get("orders-2").copied().unwrap_or(0);
    assert_eq!(first + second, 1000);
    // 统计容差：均匀分布下每个实例应明显多于 0 次
    assert!(first >= 350, "orders-1 selected only {first} times");
    assert!(second >= 350, "orders-2 selected only {second} times");
}

#[tokio::test]
async fn test_round_robin_strategy_cycles() {
    let store = Arc::new(ServiceStore::new());
    let strategies = Arc::new(StrategyRegistry::with_defaults());
    let options = LoadBalancerOptions {
        strategy: "round_robin".to_string(),
        services: vec![],
    };
    let client = LoadBalancerClient::new(options, store.clone(), strategies);

    store.set_services(
        "orders",
        vec![
            instance("orders", "orders-1", "10.0.0.1", 8080),
            instance("orders", "orders-2", "10.0.0.2", 8080),
        ],
    );

    let mut picks = Vec::new();
    for _ in 0..4 {
        let chosen = client
            .choose("orders")
            .expect("choose should not fail")
            .expect("instances are available");
        picks.push(chosen.instance_id);
    }
    assert_eq!(picks, vec!["orders-1", "orders-2", "orders-1", "orders-2"]);
}

#[tokio::test]
async fn test_per_service_strategy_override() {
    let store = Arc::new(ServiceStore::new());
    let strategies = Arc::new(StrategyRegistry::with_defaults());
    let options = LoadBalancerOptions {
        strategy: "random".to_string(),
        services: vec![flare_discovery::ServiceStrategyOption {
            name: "orders".to_string(),
            strategy: "round_robin".to_string(),
        }],
    };
    let client = LoadBalancerClient::new(options, store.clone(), strategies);

    store.set_services(
        "orders",
        vec![
            instance("orders", "orders-1", "10.0.0.1", 8080),
            instance("orders", "orders-2", "10.0.0.2", 8080),
        ],
    );

    let mut picks = Vec::new();
    for _ in 0..4 {
        picks.push(
            client
                .choose("orders")
                .expect("choose should not fail")
                .expect("instances are available")
                .instance_id,
        );
    }
    assert_eq!(picks, vec!["orders-1", "orders-2", "orders-1", "orders-2"]);
}

#[tokio::test]
async fn test_execute_success_bookkeeping() {
    let (store, client) = client_with_store();

    let inst = instance("orders", "orders-1", "10.0.0.1", 8080);
    store.set_services("orders", vec![inst.clone()]);

    let before_active = inst.health.active_requests();
    let result: Result<&str, ExecuteError<String>> =
        client.execute("orders", |_chosen| async { Ok("ok") }).await;
    assert_eq!(result.expect("request should succeed"), "ok");

    assert_eq!(inst.health.total_requests(), 1);
    assert_eq!(inst.health.active_requests(), before_active);
    assert_eq!(inst.health.failure_count(), 0);
    assert_eq!(inst.health.status(), ServiceStatus::Passing);
    assert!(inst.health.first_connection_time().is_some());
}

#[tokio::test]
async fn test_execute_failure_bookkeeping_and_error_propagation() {
    let (store, client) = client_with_store();

    // 场景：注册 orders 的单个实例，thunk 抛出 "timeout"
    let inst = instance("orders", "orders-1", "10.0.0.1", 8080);
    store.set_services("orders", vec![inst.clone()]);

    let result: Result<&str, ExecuteError<String>> = client
        .execute("orders", |_chosen| async { Err("timeout".to_string()) })
        .await;

    match result {
        Err(ExecuteError::Request(message)) => assert_eq!(message, "timeout"),
        other => panic!("expected the original request error, got {other:?}"),
    }

    let snapshot = inst.health.snapshot();
    assert_eq!(snapshot.failure_count, 1);
    assert_eq!(snapshot.active_requests, 0);
    assert_eq!(snapshot.status, ServiceStatus::Critical);
    assert_eq!(snapshot.last_failure_message, "timeout");
    assert!(snapshot.last_failure_time.is_some());
}

#[tokio::test]
async fn test_execute_on_unavailable_service() {
    let (store, client) = client_with_store();
    store.set_services("orders", vec![]);

    let result: Result<&str, ExecuteError<String>> =
        client.execute("orders", |_chosen| async { Ok("ok") }).await;
    match result {
        Err(ExecuteError::Discovery(DiscoveryError::ServiceUnavailable(name))) => {
            assert_eq!(name, "orders")
        }
        other => panic!("expected ServiceUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_response_time_average_converges_to_fixed_latency() {
    let inst = instance("orders", "orders-1", "10.0.0.1", 8080);

    // 5 次固定 100ms 的调用 ⇒ 均值收敛到 100，峰值等于 100
    for _ in 0..5 {
        inst.health.increment_active_requests();
        inst.health.increment_total_requests();
        inst.health.record_response_time(100.0);
        inst.health.decrement_active_requests();
    }

    assert!((inst.health.response_time_avg() - 100.0).abs() < f64::EPSILON);
    assert!((inst.health.response_time_max() - 100.0).abs() < f64::EPSILON);
    assert_eq!(inst.health.total_requests(), 5);
    // 最近一次耗时等于均值 ⇒ weight 为 0
    assert!(inst.health.weight().abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_execute_measures_elapsed_time() {
    let (store, client) = client_with_store();

    let inst = instance("orders", "orders-1", "10.0.0.1", 8080);
    store.set_services("orders", vec![inst.clone()]);

    let result: Result<(), ExecuteError<String>> = client
        .execute("orders", |_chosen| async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(())
        })
        .await;
    result.expect("request should succeed");

    assert!(inst.health.response_time_avg() > 0.0);
    assert!(inst.health.response_time_max() >= inst.health.response_time_avg());
}

#[tokio::test]
async fn test_stale_active_counter_resets() {
    let inst = instance("orders", "orders-1", "10.0.0.1", 8080);

    inst.health.increment_active_requests();
    assert_eq!(inst.health.active_requests(), 1);

    // 超过阈值未变化的计数在读取时归零（崩溃的调用没有机会递减）
    let eleven_seconds_later = chrono::Utc::now().timestamp_millis() + 11_000;
    assert_eq!(inst.health.active_requests_at(eleven_seconds_later), 0);
    assert_eq!(inst.health.active_requests(), 0);
}

#[tokio::test]
async fn test_weighted_strategy_prefers_faster_instance() {
    let store = Arc::new(ServiceStore::new());
    let strategies = Arc::new(StrategyRegistry::with_defaults());
    let options = LoadBalancerOptions {
        strategy: "weighted_response".to_string(),
        services: vec![],
    };
    let client = LoadBalancerClient::new(options, store.clone(), strategies);

    let fast = instance("orders", "orders-fast", "10.0.0.1", 8080);
    let slow = instance("orders", "orders-slow", "10.0.0.2", 8080);

    // fast 最近一次比自身均值快，slow 明显变慢
    for health in [&fast.health, &slow.health] {
        health.increment_total_requests();
        health.record_response_time(100.0);
    }
    fast.health.increment_total_requests();
    fast.health.record_response_time(40.0);
    slow.health.increment_total_requests();
    slow.health.record_response_time(400.0);

    store.set_services("orders", vec![fast.clone(), slow.clone()]);

    let chosen = client
        .choose("orders")
        .expect("choose should not fail")
        .expect("instances are available");
    assert_eq!(chosen.instance_id, "orders-fast");
}

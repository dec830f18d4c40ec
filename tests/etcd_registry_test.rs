//! etcd 注册中心集成测试
//!
//! 这些测试需要运行中的 etcd 服务器实例。
//! 默认情况下会被忽略，需要使用 `cargo test --test etcd_registry_test -- --ignored` 运行。
//!
//! 启动 etcd 服务器：
//! ```bash
//! docker run -d --name etcd-test -p 2379:2379 -p 2380:2380 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//! ```

use flare_discovery::config::{
    CheckType, Config, DiscoveryOptions, HeartbeatOptions, LoadBalancerOptions, RegistryConfig,
    ServiceConfig,
};
use flare_discovery::registry::{EtcdRegistry, ServiceRegistry};
use flare_discovery::{ServiceStatus, ServiceStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, sleep};

/// etcd 服务器地址，可通过环境变量 ETCD_ENDPOINTS 覆盖
fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["http://127.0.0.1:2379".to_string()])
}

fn etcd_config(service: &str, instance_id: &str, port: u16) -> Config {
    Config {
        service: ServiceConfig {
            name: service.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            tags: vec![],
            metadata: HashMap::new(),
            version: Some("1.0.0".to_string()),
            domain: None,
            id: Some(instance_id.to_string()),
            status: None,
        },
        registry: RegistryConfig {
            backend: "etcd".to_string(),
            endpoints: etcd_endpoints(),
            namespace: "flare-service-test".to_string(),
            acl_token: None,
        },
        discovery: Some(DiscoveryOptions {
            check_type: CheckType::Ttl,
            health_endpoint: None,
            tcp_target: None,
            interval: 10,
            timeout: 10,
            fail_fast: false,
            scheme: None,
            skip_verify_tls: true,
            deregister_critical_after: None,
            notes: None,
        }),
        heartbeat: Some(HeartbeatOptions {
            enabled: true,
            ttl_in_seconds: Some(10),
        }),
        loadbalancer: LoadBalancerOptions::default(),
    }
}

/// 构建器是纯逻辑，不需要 etcd 实例
#[test]
fn test_etcd_builder_synthesizes_instance() {
    use flare_discovery::registry::{EtcdRegistrationBuilder, Registration};

    let registration = EtcdRegistrationBuilder::new()
        .service_name("orders")
        .host("10.0.0.1")
        .port(8080)
        .version(Some("2.0.0".to_string()))
        .tags(vec!["core".to_string()])
        .instance_id(Some("node-1".to_string()))
        .build()
        .expect("builder should succeed");

    assert_eq!(registration.instance_id(), "node-1-2.0.0");
    assert_eq!(registration.service_id(), "orders");

    let instance = registration.to_instance();
    assert_eq!(instance.status, ServiceStatus::Passing);
    assert_eq!(instance.tags[..2], ["service".to_string(), "2.0.0".to_string()]);
    assert_eq!(instance.metadata.get("version").map(String::as_str), Some("2.0.0"));
    assert_eq!(instance.uri(), "http://10.0.0.1:8080");
}

#[test]
fn test_etcd_builder_requires_identity_fields() {
    use flare_discovery::DiscoveryError;
    use flare_discovery::registry::EtcdRegistrationBuilder;

    let missing_name = EtcdRegistrationBuilder::new()
        .host("10.0.0.1")
        .port(8080)
        .build();
    assert!(matches!(missing_name, Err(DiscoveryError::Configuration(_))));

    let missing_port = EtcdRegistrationBuilder::new()
        .service_name("orders")
        .host("10.0.0.1")
        .build();
    assert!(matches!(missing_port, Err(DiscoveryError::Configuration(_))));
}

/// 测试：注册 + watch 同步进缓存 + 注销
#[tokio::test]
#[ignore]
async fn test_etcd_register_watch_deregister() {
    let store = Arc::new(ServiceStore::new());
    let registry = EtcdRegistry::new(etcd_config("test-orders", "node-1", 8080), store.clone())
        .await
        .expect("failed to connect to etcd");

    registry.init().await.expect("init should succeed");
    registry.register().await.expect("register should succeed");
    registry.watch_all().await.expect("watch_all should succeed");

    // 等 watch 的全量重同步落地
    sleep(Duration::from_millis(1500)).await;

    let nodes = store.service_nodes("test-orders", false);
    assert!(
        nodes.iter().any(|n| n.instance_id == "node-1-1.0.0"),
        "own instance should be discoverable after registration"
    );
    // 临时节点没有检查对象，存在即 passing
    assert!(nodes.iter().all(|n| n.status == ServiceStatus::Passing));

    registry.deregister().await;
    sleep(Duration::from_millis(1500)).await;

    let nodes = store.service_nodes("test-orders", false);
    assert!(
        !nodes.iter().any(|n| n.instance_id == "node-1-1.0.0"),
        "instance should disappear after deregistration"
    );

    registry.close().await;
}

/// 测试：watch 观察到其他注册方的增删
#[tokio::test]
#[ignore]
async fn test_etcd_watch_sees_sibling_registrations() {
    let store_a = Arc::new(ServiceStore::new());
    let registry_a = EtcdRegistry::new(etcd_config("test-billing", "node-a", 8081), store_a.clone())
        .await
        .expect("failed to connect to etcd");
    registry_a.init().await.expect("init should succeed");
    registry_a.watch_all().await.expect("watch_all should succeed");

    let store_b = Arc::new(ServiceStore::new());
    let registry_b = EtcdRegistry::new(etcd_config("test-billing", "node-b", 8082), store_b)
        .await
        .expect("failed to connect to etcd");
    registry_b.init().await.expect("init should succeed");
    registry_b.register().await.expect("register should succeed");

    sleep(Duration::from_millis(1500)).await;

    let nodes = store_a.service_nodes("test-billing", false);
    assert!(
        nodes.iter().any(|n| n.instance_id == "node-b-1.0.0"),
        "watcher should observe sibling registration"
    );

    registry_b.deregister().await;
    registry_b.close().await;
    registry_a.close().await;
}

/// 测试：心跳续期让租约存活超过一个 TTL 周期
#[tokio::test]
#[ignore]
async fn test_etcd_heartbeat_keeps_lease_alive() {
    let store = Arc::new(ServiceStore::new());
    let registry = EtcdRegistry::new(etcd_config("test-orders", "node-hb", 8083), store.clone())
        .await
        .expect("failed to connect to etcd");

    registry.init().await.expect("init should succeed");
    registry.register().await.expect("register should succeed");
    registry.watch_all().await.expect("watch_all should succeed");

    // TTL 10s，心跳周期 5s：12s 后节点应该仍然存在
    sleep(Duration::from_secs(12)).await;

    let nodes = store.service_nodes("test-orders", false);
    assert!(
        nodes.iter().any(|n| n.instance_id == "node-hb-1.0.0"),
        "lease renewal should keep the node alive past its ttl"
    );

    registry.deregister().await;
    registry.close().await;
}

/// 测试：重复注册是幂等覆盖（重连后的再注册不是错误）
#[tokio::test]
#[ignore]
async fn test_etcd_reregistration_is_idempotent() {
    let store = Arc::new(ServiceStore::new());
    let registry = EtcdRegistry::new(etcd_config("test-orders", "node-re", 8084), store.clone())
        .await
        .expect("failed to connect to etcd");

    registry.init().await.expect("init should succeed");
    registry.register().await.expect("first register should succeed");
    registry.register().await.expect("re-register should succeed");
    registry.watch_all().await.expect("watch_all should succeed");

    sleep(Duration::from_millis(1500)).await;

    let nodes = store.service_nodes("test-orders", false);
    let matching: Vec<_> = nodes
        .iter()
        .filter(|n| n.instance_id == "node-re-1.0.0")
        .collect();
    assert_eq!(matching.len(), 1, "re-registration must not duplicate the node");

    registry.deregister().await;
    registry.close().await;
}

//! Flare Cloud Discovery
//!
//! Client-side service discovery and load balancing: registry protocol against
//! Consul / etcd, an observable service-instance cache, and pluggable selection
//! strategies with per-instance health feedback.

pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod instance;
pub mod registry;
pub mod runtime;
pub mod store;

// Re-exports
pub use balancer::{
    ExecuteError, LoadBalancerClient, RandomStrategy, RoundRobinStrategy, SelectionStrategy,
    ServiceInstancePool, StrategyRegistry, WeightedResponseStrategy,
};
pub use config::{
    CheckType, Config, DiscoveryOptions, HeartbeatOptions, LoadBalancerOptions, RegistryConfig,
    ServiceConfig, ServiceStrategyOption,
};
pub use error::{DiscoveryError, Result};
pub use health::{HealthSnapshot, InstanceHealth};
pub use instance::{ServiceInstance, ServiceStatus};
pub use registry::{
    ChangeEvent, ConsulClient, ConsulRegistrationBuilder, ConsulRegistry, CoordinationClient,
    EtcdClient, EtcdRegistrationBuilder, EtcdRegistry, HeartbeatTask, Registration,
    ServiceRegistry, TtlScheduler, create_registry,
};
pub use runtime::{DiscoveryRuntime, init_logging};
pub use store::{ServiceStore, StoreAction, WatchCallback};

//! 服务注册发现模块
//!
//! 支持两种协调后端：Consul（健康检查模型）和 etcd（临时节点模型）

pub mod backend;
pub mod consul;
pub mod etcd;
pub mod heartbeat;
pub mod registration;
pub mod trait_def;

use crate::config::Config;
use crate::error::Result;
use crate::store::ServiceStore;
use std::sync::Arc;

pub use backend::{ChangeEvent, CoordinationClient};
pub use consul::{
    AgentCheck, AgentService, ConsulClient, ConsulRegistration, ConsulRegistrationBuilder,
    ConsulRegistry, aggregate_check_status, health_entries_to_instances,
};
pub use etcd::{EtcdClient, EtcdRegistration, EtcdRegistrationBuilder, EtcdRegistry};
pub use heartbeat::{HeartbeatTask, TtlScheduler};
pub use registration::Registration;
pub use trait_def::ServiceRegistry;

/// 注册中心类型
#[derive(Debug, Clone)]
pub enum RegistryType {
    Etcd,
    Consul,
}

impl RegistryType {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "consul" => RegistryType::Consul,
            _ => RegistryType::Etcd,
        }
    }
}

/// 创建服务注册中心实例
pub async fn create_registry(
    config: Config,
    store: Arc<ServiceStore>,
) -> Result<Arc<dyn ServiceRegistry>> {
    let registry_type = RegistryType::from_str(&config.registry.backend);

    match registry_type {
        RegistryType::Etcd => {
            let registry = EtcdRegistry::new(config, store).await?;
            Ok(Arc::new(registry))
        }
        RegistryType::Consul => {
            let registry = ConsulRegistry::new(config, store)?;
            Ok(Arc::new(registry))
        }
    }
}

//! 运行时装配
//!
//! 以显式构造注入的方式组装 ServiceStore、注册中心后端、策略注册表
//! 与负载均衡客户端，并提供启动/停机的生命周期入口。

use crate::balancer::{LoadBalancerClient, StrategyRegistry};
use crate::config::Config;
use crate::error::Result;
use crate::registry::{ServiceRegistry, create_registry};
use crate::store::ServiceStore;
use std::sync::Arc;

/// 发现运行时
///
/// 进程内创建一次；start 完成后注册中心处于稳态
/// （心跳与 watch 并行），负载均衡客户端即可使用。
pub struct DiscoveryRuntime {
    store: Arc<ServiceStore>,
    registry: Arc<dyn ServiceRegistry>,
    strategies: Arc<StrategyRegistry>,
    client: Arc<LoadBalancerClient>,
}

impl DiscoveryRuntime {
    /// 按配置装配全部组件
    pub async fn new(config: Config) -> Result<Self> {
        let store = Arc::new(ServiceStore::new());
        let strategies = Arc::new(StrategyRegistry::with_defaults());
        let client = Arc::new(LoadBalancerClient::new(
            config.loadbalancer.clone(),
            store.clone(),
            strategies.clone(),
        ));
        let registry = create_registry(config, store.clone()).await?;

        Ok(Self {
            store,
            registry,
            strategies,
            client,
        })
    }

    /// 初始化、注册并建立 watch
    pub async fn start(&self) -> Result<()> {
        self.registry.init().await?;
        self.registry.register().await?;
        self.registry.watch_all().await?;
        Ok(())
    }

    /// 停机：注销（尽力而为）、停止后台任务、清空观察者
    ///
    /// 注销错误只记录，停机流程无条件走完。
    pub async fn shutdown(&self) {
        self.registry.deregister().await;
        self.registry.close().await;
        self.store.close();
    }

    pub fn store(&self) -> Arc<ServiceStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<dyn ServiceRegistry> {
        self.registry.clone()
    }

    pub fn strategies(&self) -> Arc<StrategyRegistry> {
        self.strategies.clone()
    }

    pub fn client(&self) -> Arc<LoadBalancerClient> {
        self.client.clone()
    }
}

/// 初始化 tracing 日志（进程内调用一次，重复调用安全）
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

//! 负载均衡策略抽象

use crate::error::{DiscoveryError, Result};
use crate::instance::ServiceInstance;
use crate::store::ServiceStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// 实例池
///
/// 策略持有的不是实例快照，而是对 ServiceStore 的实时读取视图，
/// 新鲜度与 watch 同步粒度一致。
#[derive(Clone)]
pub struct ServiceInstancePool {
    service_id: String,
    store: Arc<ServiceStore>,
    only_passing: bool,
}

impl ServiceInstancePool {
    pub fn new(service_id: impl Into<String>, store: Arc<ServiceStore>) -> Self {
        Self {
            service_id: service_id.into(),
            store,
            only_passing: false,
        }
    }

    /// 只读取 passing 状态的实例
    pub fn passing_only(mut self) -> Self {
        self.only_passing = true;
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// 当前已知的实例列表
    pub fn get(&self) -> Vec<ServiceInstance> {
        self.store
            .service_nodes(&self.service_id, self.only_passing)
    }
}

/// 实例选择策略
///
/// `choose` 返回 `None` 表示服务当前没有可用实例，调用方把它当作
/// "服务暂不可用" 处理，而不是错误。策略本身不做健康过滤，
/// 需要时通过实例池的 passing_only 选项完成。
pub trait SelectionStrategy: Send + Sync {
    /// 绑定到某个服务的实例池
    fn init(&mut self, service_id: String, pool: ServiceInstancePool);

    /// 从池中选出一个实例
    fn choose(&self) -> Option<ServiceInstance>;
}

/// 策略工厂
pub type StrategyFactory = Box<dyn Fn() -> Box<dyn SelectionStrategy> + Send + Sync>;

/// 策略注册表
///
/// 名称 → 工厂的静态表，进程启动时显式注册；解析未知名称是
/// 明确的错误，不会静默退回缺省策略。
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: RwLock<HashMap<String, StrategyFactory>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带内置策略的注册表
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("random", || {
            Box::new(super::random::RandomStrategy::new())
        });
        registry.register("round_robin", || {
            Box::new(super::round_robin::RoundRobinStrategy::new())
        });
        registry.register("weighted_response", || {
            Box::new(super::weighted::WeightedResponseStrategy::new())
        });
        registry
    }

    /// 注册策略工厂（重名以先注册者为准）
    pub fn register(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn SelectionStrategy> + Send + Sync + 'static,
    ) {
        let mut strategies = self.strategies.write();
        strategies
            .entry(name.into())
            .or_insert_with(|| Box::new(factory));
    }

    /// 按名称实例化策略
    pub fn create(&self, name: &str) -> Result<Box<dyn SelectionStrategy>> {
        let strategies = self.strategies.read();
        strategies
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| DiscoveryError::StrategyNotFound(name.to_string()))
    }

    /// 已注册的策略名
    pub fn names(&self) -> Vec<String> {
        self.strategies.read().keys().cloned().collect()
    }
}

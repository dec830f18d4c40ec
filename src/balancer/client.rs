//! 负载均衡客户端
//!
//! 为每个服务绑定一个选择策略，按调用选取实例，并把执行结果
//! （时延、失败、活跃数）记回实例健康状态，形成闭环。

use super::strategy::{SelectionStrategy, ServiceInstancePool, StrategyRegistry};
use crate::config::LoadBalancerOptions;
use crate::error::{DiscoveryError, Result};
use crate::instance::ServiceInstance;
use crate::store::ServiceStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// execute 的错误：选取阶段的发现错误，或请求本身的失败
///
/// 请求错误原样抛回调用方，记账在抛回之前已经完成。
#[derive(Debug)]
pub enum ExecuteError<E> {
    Discovery(DiscoveryError),
    Request(E),
}

impl<E> ExecuteError<E> {
    /// 取出请求自身的错误（如果是）
    pub fn into_request(self) -> Option<E> {
        match self {
            ExecuteError::Request(e) => Some(e),
            ExecuteError::Discovery(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for ExecuteError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteError::Discovery(e) => write!(f, "{e}"),
            ExecuteError::Request(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for ExecuteError<E> {}

impl<E> From<DiscoveryError> for ExecuteError<E> {
    fn from(e: DiscoveryError) -> Self {
        ExecuteError::Discovery(e)
    }
}

/// 负载均衡客户端
pub struct LoadBalancerClient {
    options: LoadBalancerOptions,
    store: Arc<ServiceStore>,
    registry: Arc<StrategyRegistry>,
    strategies: RwLock<HashMap<String, Box<dyn SelectionStrategy>>>,
}

impl LoadBalancerClient {
    pub fn new(
        options: LoadBalancerOptions,
        store: Arc<ServiceStore>,
        registry: Arc<StrategyRegistry>,
    ) -> Self {
        Self {
            options,
            store,
            registry,
            strategies: RwLock::new(HashMap::new()),
        }
    }

    /// 服务第一次被看到时惰性建立策略绑定
    ///
    /// 缓存里从未出现过的服务名视为未知服务；实例列表为空但服务名
    /// 存在是合法状态，choose 会返回 None。
    fn ensure_strategy(&self, service_id: &str) -> Result<()> {
        if self.strategies.read().contains_key(service_id) {
            return Ok(());
        }
        if !self.store.has_service(service_id) {
            return Err(DiscoveryError::UnknownService(service_id.to_string()));
        }

        let name = self.options.strategy_for(service_id);
        let mut strategy = self.registry.create(name)?;
        strategy.init(
            service_id.to_string(),
            ServiceInstancePool::new(service_id, self.store.clone()),
        );

        let mut strategies = self.strategies.write();
        strategies.entry(service_id.to_string()).or_insert(strategy);
        Ok(())
    }

    /// 为服务选出一个实例
    ///
    /// `Ok(None)` 表示服务存在但当前没有实例可用。
    pub fn choose(&self, service_id: &str) -> Result<Option<ServiceInstance>> {
        self.ensure_strategy(service_id)?;
        let strategies = self.strategies.read();
        let strategy = strategies
            .get(service_id)
            .ok_or_else(|| DiscoveryError::UnknownService(service_id.to_string()))?;
        Ok(strategy.choose())
    }

    /// 选取实例并执行请求
    pub async fn execute<T, E, F, Fut>(
        &self,
        service_id: &str,
        request: F,
    ) -> std::result::Result<T, ExecuteError<E>>
    where
        F: FnOnce(ServiceInstance) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        let instance = self
            .choose(service_id)?
            .ok_or_else(|| DiscoveryError::ServiceUnavailable(service_id.to_string()))?;
        self.execute_on(&instance, request).await
    }

    /// 在指定实例上执行请求
    ///
    /// 记账保证在两条路径上都发生：调用前递增活跃数/累计数并记录首连时间，
    /// 成功后记录耗时、失败后记录失败信息，之后才把结果交还调用方。
    pub async fn execute_on<T, E, F, Fut>(
        &self,
        instance: &ServiceInstance,
        request: F,
    ) -> std::result::Result<T, ExecuteError<E>>
    where
        F: FnOnce(ServiceInstance) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        let health = instance.health.clone();
        health.increment_active_requests();
        health.increment_total_requests();
        health.set_first_connection_time();

        let start = Instant::now();
        match request(instance.clone()).await {
            Ok(response) => {
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                health.record_response_time(elapsed_ms);
                health.decrement_active_requests();
                Ok(response)
            }
            Err(e) => {
                health.decrement_active_requests();
                health.mark_failed(e.to_string());
                Err(ExecuteError::Request(e))
            }
        }
    }
}

//! 按响应时间趋势加权的选择策略

use super::strategy::{SelectionStrategy, ServiceInstancePool};
use crate::instance::ServiceInstance;
use std::cmp::Ordering;
use tracing::warn;

/// 偏向响应时间趋势更好的实例
///
/// 执行包装器把每次耗时与实例自身均值的差写进 weight：
/// 负值表示最近一次比自身平均更快。这里直接取 weight 最小的实例，
/// 未被测量过的实例（weight 初始为 -1）自然获得首选机会。
#[derive(Default)]
pub struct WeightedResponseStrategy {
    service_id: String,
    pool: Option<ServiceInstancePool>,
}

impl WeightedResponseStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for WeightedResponseStrategy {
    fn init(&mut self, service_id: String, pool: ServiceInstancePool) {
        self.service_id = service_id;
        self.pool = Some(pool);
    }

    fn choose(&self) -> Option<ServiceInstance> {
        let nodes = self.pool.as_ref()?.get();
        if nodes.is_empty() {
            warn!("no live servers available for service: {}", self.service_id);
            return None;
        }
        nodes.into_iter().min_by(|a, b| {
            a.health
                .weight()
                .partial_cmp(&b.health.weight())
                .unwrap_or(Ordering::Equal)
        })
    }
}

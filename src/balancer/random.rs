//! 随机选择策略

use super::strategy::{SelectionStrategy, ServiceInstancePool};
use crate::instance::ServiceInstance;
use rand::Rng;
use tracing::warn;

/// 在全部已知实例中等概率随机选择
#[derive(Default)]
pub struct RandomStrategy {
    service_id: String,
    pool: Option<ServiceInstancePool>,
}

impl RandomStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RandomStrategy {
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
        let idx = rand::thread_rng().gen_range(0..nodes.len());
        nodes.into_iter().nth(idx)
    }
}

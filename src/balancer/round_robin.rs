//! 轮询选择策略

use super::strategy::{SelectionStrategy, ServiceInstancePool};
use crate::instance::ServiceInstance;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// 按序轮转全部已知实例
///
/// 位置计数对实例数取模，池在两次选择之间伸缩时顺序会有抖动，
/// 但不会选出池外实例。
#[derive(Default)]
pub struct RoundRobinStrategy {
    service_id: String,
    pool: Option<ServiceInstancePool>,
    position: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobinStrategy {
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
        let idx = self.position.fetch_add(1, Ordering::Relaxed) % nodes.len();
        nodes.into_iter().nth(idx)
    }
}

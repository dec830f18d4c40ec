//! 心跳任务与 TTL 调度器

use crate::config::HeartbeatOptions;
use crate::registry::backend::CoordinationClient;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 单次存活续期任务
///
/// 失败只记录日志，绝不向外传播：一次心跳丢失只是存活风险，
/// 代价最多是后端让注册过期，不应拖垮进程。
pub struct HeartbeatTask {
    client: Arc<dyn CoordinationClient>,
    check_id: String,
}

impl HeartbeatTask {
    /// 按 `service:<instanceId>` 约定推导 check id
    pub fn new(client: Arc<dyn CoordinationClient>, instance_id: &str) -> Self {
        let check_id = if instance_id.starts_with("service:") {
            instance_id.to_string()
        } else {
            format!("service:{instance_id}")
        };
        Self { client, check_id }
    }

    pub fn check_id(&self) -> &str {
        &self.check_id
    }

    /// 执行一次存活续期
    pub async fn run(&self) {
        match self.client.renew_liveness(&self.check_id).await {
            Ok(()) => debug!("sent heartbeat for: {}", self.check_id),
            Err(e) => warn!("failed to send heartbeat for {}: {}", self.check_id, e),
        }
    }
}

/// TTL 调度器
///
/// 每个已注册实例 id 对应一个周期任务；周期取 TTL 的一半（至少 1 秒），
/// 保证在后端判定过期之前至少续期一次。
pub struct TtlScheduler {
    heartbeat: HeartbeatOptions,
    task: Arc<HeartbeatTask>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TtlScheduler {
    pub fn new(heartbeat: HeartbeatOptions, task: HeartbeatTask) -> Self {
        Self {
            heartbeat,
            task: Arc::new(task),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// 心跳周期
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs((self.heartbeat.ttl() / 2).max(1))
    }

    /// 为实例启动周期心跳
    pub fn add(&self, instance_id: impl Into<String>) {
        let instance_id = instance_id.into();
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&instance_id) {
            return;
        }

        let task = self.task.clone();
        let period = self.heartbeat_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                task.run().await;
            }
        });
        tasks.insert(instance_id, handle);
    }

    /// 停止某实例的心跳
    pub fn remove(&self, instance_id: &str) {
        if let Some(handle) = self.tasks.lock().remove(instance_id) {
            handle.abort();
        }
    }
}

impl Drop for TtlScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

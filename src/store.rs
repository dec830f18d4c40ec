//! 服务实例缓存
//!
//! 注册中心通过 watch 推送实例变更，负载均衡器在每次调用时读取。
//! 所有变更操作对并发读者原子生效，读者不会观察到半更新的列表；
//! 每次变更都会向注册的观察者发出 `(动作, 服务名, 受影响实例)` 事件。

use crate::instance::{ServiceInstance, ServiceStatus};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// 存储变更动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    Added,
    Removed,
}

/// watch 回调签名
pub type WatchCallback = Box<dyn Fn(StoreAction, &str, &[ServiceInstance]) + Send + Sync>;

/// 服务实例缓存
///
/// 进程内唯一，生命周期与进程一致，仅在显式 reset/close 时清空。
#[derive(Default)]
pub struct ServiceStore {
    services: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    watchers: Mutex<Vec<WatchCallback>>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前已知的服务名集合
    pub fn service_names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    /// 是否观察到过该服务（实例列表为空也算）
    pub fn has_service(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    /// 某服务的实例列表
    ///
    /// `only_passing` 为 true 时仅返回状态为 passing 的实例。
    pub fn service_nodes(&self, name: &str, only_passing: bool) -> Vec<ServiceInstance> {
        let services = self.services.read();
        let nodes = match services.get(name) {
            Some(nodes) => nodes.clone(),
            None => return Vec::new(),
        };
        if only_passing {
            nodes
                .into_iter()
                .filter(|node| node.status == ServiceStatus::Passing)
                .collect()
        } else {
            nodes
        }
    }

    /// 全量快照
    pub fn services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.services.read().clone()
    }

    /// 按 instance_id 插入或更新单个实例
    pub fn add_service(&self, name: &str, instance: ServiceInstance) {
        {
            let mut services = self.services.write();
            let nodes = services.entry(name.to_string()).or_default();
            upsert(nodes, instance.clone());
        }
        self.emit(StoreAction::Added, name, &[instance]);
    }

    /// 批量插入或更新实例（一次事件）
    pub fn add_services(&self, name: &str, instances: Vec<ServiceInstance>) {
        if instances.is_empty() {
            return;
        }
        {
            let mut services = self.services.write();
            let nodes = services.entry(name.to_string()).or_default();
            for instance in &instances {
                upsert(nodes, instance.clone());
            }
        }
        self.emit(StoreAction::Added, name, &instances);
    }

    /// 原子替换某服务的全部实例（全量重同步路径）
    pub fn set_services(&self, name: &str, instances: Vec<ServiceInstance>) {
        {
            let mut services = self.services.write();
            services.insert(name.to_string(), instances.clone());
        }
        self.emit(StoreAction::Added, name, &instances);
    }

    /// 移除整个服务
    pub fn remove_service(&self, name: &str) {
        let removed = {
            let mut services = self.services.write();
            services.remove(name)
        };
        if let Some(removed) = removed {
            self.emit(StoreAction::Removed, name, &removed);
        }
    }

    /// 移除某服务的单个实例
    ///
    /// 最后一个实例移除后整个服务条目随之消失。
    /// 未知服务或未知实例 id 是 no-op，不报错。
    pub fn remove_service_node(&self, name: &str, instance_id: &str) {
        let removed = {
            let mut services = self.services.write();
            let Some(nodes) = services.get_mut(name) else {
                return;
            };
            let Some(idx) = nodes.iter().position(|n| n.instance_id == instance_id) else {
                return;
            };
            let removed = nodes.remove(idx);
            if nodes.is_empty() {
                services.remove(name);
            }
            removed
        };
        self.emit(StoreAction::Removed, name, std::slice::from_ref(&removed));
    }

    /// 清空全部缓存（不发事件）
    pub fn reset(&self) {
        self.services.write().clear();
    }

    /// 注册变更观察者，按注册顺序回调
    pub fn watch(&self, callback: impl Fn(StoreAction, &str, &[ServiceInstance]) + Send + Sync + 'static) {
        self.watchers.lock().push(Box::new(callback));
    }

    /// 解除全部观察者
    pub fn close(&self) {
        self.watchers.lock().clear();
    }

    fn emit(&self, action: StoreAction, name: &str, affected: &[ServiceInstance]) {
        let watchers = self.watchers.lock();
        for watcher in watchers.iter() {
            watcher(action, name, affected);
        }
    }
}

fn upsert(nodes: &mut Vec<ServiceInstance>, instance: ServiceInstance) {
    match nodes
        .iter_mut()
        .find(|n| n.instance_id == instance.instance_id)
    {
        Some(existing) => *existing = instance,
        None => nodes.push(instance),
    }
}

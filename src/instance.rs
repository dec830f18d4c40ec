//! 服务实例定义

use crate::health::InstanceHealth;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 服务状态（与 Consul 检查状态对齐）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Passing,
    Warning,
    #[default]
    Critical,
}

impl ServiceStatus {
    /// 从后端状态字符串解析，未知状态一律按 critical 处理
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "passing" | "up" => ServiceStatus::Passing,
            "warning" => ServiceStatus::Warning,
            _ => ServiceStatus::Critical,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Passing => write!(f, "passing"),
            ServiceStatus::Warning => write!(f, "warning"),
            ServiceStatus::Critical => write!(f, "critical"),
        }
    }
}

/// 服务实例
///
/// 一个已注册服务进程的身份信息。身份字段（`service_id`、`host`、`port`）
/// 构造后不再变化；`instance_id` 在同一服务的实例列表内唯一。
/// 运行期健康状态挂在共享的 [`InstanceHealth`] 上，不参与序列化与比较。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// 实例 ID（一次注册内唯一）
    pub instance_id: String,

    /// 逻辑服务名
    pub service_id: String,

    /// 服务地址
    pub host: String,

    /// 服务端口
    pub port: u16,

    /// 是否使用 TLS
    #[serde(default)]
    pub secure: bool,

    /// 自定义标签
    #[serde(default)]
    pub tags: Vec<String>,

    /// 元数据
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// 协调后端的节点标识（可能等于 instance_id）
    #[serde(default)]
    pub node_id: String,

    /// 后端视角的服务状态
    #[serde(default)]
    pub status: ServiceStatus,

    /// 运行期健康状态（由负载均衡执行包装器独占修改）
    #[serde(skip, default)]
    pub health: Arc<InstanceHealth>,
}

impl ServiceInstance {
    /// 创建新的服务实例
    pub fn new(
        service_id: impl Into<String>,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let instance_id = instance_id.into();
        Self {
            node_id: instance_id.clone(),
            instance_id,
            service_id: service_id.into(),
            host: host.into(),
            port,
            secure: false,
            tags: Vec::new(),
            metadata: HashMap::new(),
            status: ServiceStatus::Critical,
            health: Arc::new(InstanceHealth::new()),
        }
    }

    /// 设置 TLS 标志
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// 设置标签
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 设置节点标识
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// 设置服务状态
    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    /// URI scheme，由 TLS 标志推导
    pub fn scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }

    /// 完整访问地址，如 `http://10.0.0.1:8080`
    pub fn uri(&self) -> String {
        format!("{}://{}:{}", self.scheme(), self.host, self.port)
    }
}

/// 相等性只比较身份字段，健康状态不参与
impl PartialEq for ServiceInstance {
    fn eq(&self, other: &Self) -> bool {
        self.instance_id == other.instance_id
            && self.service_id == other.service_id
            && self.host == other.host
            && self.port == other.port
            && self.secure == other.secure
            && self.tags == other.tags
            && self.metadata == other.metadata
            && self.node_id == other.node_id
            && self.status == other.status
    }
}

impl Eq for ServiceInstance {}

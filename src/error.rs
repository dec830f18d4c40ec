//! 服务发现统一错误类型

use thiserror::Error;

/// 服务发现统一错误类型
///
/// 错误分类决定处理策略：配置错误不重试，连接错误在注册阶段按固定退避重试，
/// 后端瞬时错误跳过单条记录但不中断批次处理。
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    /// 配置错误（缺少必填字段，属于编程/配置问题，不重试）
    #[error("configuration error: {0}")]
    Configuration(String),

    /// 连接错误（后端不可达或尚未就绪）
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// 后端瞬时错误（单个节点读取/解析失败等）
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    /// 负载均衡器从未观察到该服务
    #[error("service [{0}] does not exist with a load balance strategy")]
    UnknownService(String),

    /// 服务当前没有可用实例
    #[error("no live instance available for service [{0}]")]
    ServiceUnavailable(String),

    /// 策略名称未注册
    #[error("load balance strategy [{0}] is not registered")]
    StrategyNotFound(String),

    /// 序列化/反序列化错误
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DiscoveryError {
    /// 创建配置错误
    pub fn configuration(msg: impl Into<String>) -> Self {
        DiscoveryError::Configuration(msg.into())
    }

    /// 创建连接错误
    pub fn connectivity(msg: impl Into<String>) -> Self {
        DiscoveryError::Connectivity(msg.into())
    }

    /// 创建后端瞬时错误
    pub fn transient(msg: impl Into<String>) -> Self {
        DiscoveryError::TransientBackend(msg.into())
    }

    /// 创建序列化错误
    pub fn serialization(msg: impl Into<String>) -> Self {
        DiscoveryError::Serialization(msg.into())
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Connectivity(_) | DiscoveryError::TransientBackend(_)
        )
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(e: serde_json::Error) -> Self {
        DiscoveryError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(e: reqwest::Error) -> Self {
        DiscoveryError::Connectivity(e.to_string())
    }
}

impl From<etcd_client::Error> for DiscoveryError {
    fn from(e: etcd_client::Error) -> Self {
        DiscoveryError::Connectivity(e.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, DiscoveryError>;

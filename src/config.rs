//! 配置定义与加载

use crate::error::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 心跳 TTL 缺省值（秒）
pub const DEFAULT_TTL_SECONDS: u64 = 30;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub registry: RegistryConfig,
    pub discovery: Option<DiscoveryOptions>,
    pub heartbeat: Option<HeartbeatOptions>,
    #[serde(default)]
    pub loadbalancer: LoadBalancerOptions,
}

/// 本进程要注册的服务描述
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub version: Option<String>,
    pub domain: Option<String>,
    pub id: Option<String>,
    pub status: Option<String>,
}

/// 协调后端连接配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// 后端类型：consul | etcd
    #[serde(default = "default_backend")]
    pub backend: String,
    pub endpoints: Vec<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Consul ACL token（可选）
    pub acl_token: Option<String>,
}

fn default_backend() -> String {
    "etcd".to_string()
}

fn default_namespace() -> String {
    "flare-service".to_string()
}

/// 健康检查类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Http,
    Tcp,
    #[default]
    Ttl,
}

/// 注册时提交给后端的发现/健康检查选项
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryOptions {
    #[serde(rename = "type", default)]
    pub check_type: CheckType,

    /// HTTP 探测地址（check_type = http 时必填）
    pub health_endpoint: Option<String>,

    /// TCP 探测目标（check_type = tcp 时必填）
    pub tcp_target: Option<String>,

    /// 探测间隔（秒）
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// 探测超时（秒）
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// 注册重试耗尽后是否直接失败（默认 false：降级继续运行）
    #[serde(default)]
    pub fail_fast: bool,

    /// URI scheme：http | https
    pub scheme: Option<String>,

    /// HTTP 探测是否跳过 TLS 校验
    #[serde(default = "default_true")]
    pub skip_verify_tls: bool,

    /// 持续 critical 多久后由后端自动注销，如 "30m"
    pub deregister_critical_after: Option<String>,

    /// 检查备注
    pub notes: Option<String>,
}

fn default_interval() -> u64 {
    10
}

fn default_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl DiscoveryOptions {
    /// scheme 是否为 https
    pub fn is_secure(&self) -> bool {
        self.scheme.as_deref() == Some("https")
    }
}

/// 心跳选项
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatOptions {
    pub enabled: bool,
    pub ttl_in_seconds: Option<u64>,
}

impl HeartbeatOptions {
    /// TTL 秒数，未配置时使用缺省值
    pub fn ttl(&self) -> u64 {
        self.ttl_in_seconds.unwrap_or(DEFAULT_TTL_SECONDS)
    }
}

/// 负载均衡配置：全局缺省策略 + 按服务覆盖
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadBalancerOptions {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub services: Vec<ServiceStrategyOption>,
}

fn default_strategy() -> String {
    "random".to_string()
}

impl Default for LoadBalancerOptions {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            services: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceStrategyOption {
    pub name: String,
    pub strategy: String,
}

impl LoadBalancerOptions {
    /// 解析某服务应使用的策略名
    pub fn strategy_for(&self, service: &str) -> &str {
        self.services
            .iter()
            .find(|option| option.name == service)
            .map(|option| option.strategy.as_str())
            .unwrap_or(&self.strategy)
    }
}

impl Config {
    /// 从 TOML 文件加载配置
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DiscoveryError::configuration(format!("failed to read {path}: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| DiscoveryError::configuration(format!("failed to parse {path}: {e}")))?;
        Ok(config)
    }

    /// 注册前的必填项校验
    ///
    /// 缺少服务名/地址/端口或 discovery/heartbeat 配置块属于致命配置错误，
    /// 在 init 阶段直接失败，不重试。
    pub fn validate_for_registration(&self) -> Result<()> {
        if self.heartbeat.is_none() {
            return Err(DiscoveryError::configuration(
                "heartbeat options are required",
            ));
        }
        if self.discovery.is_none() {
            return Err(DiscoveryError::configuration(
                "discovery options are required",
            ));
        }
        if self.service.name.trim().is_empty() {
            return Err(DiscoveryError::configuration("service name is required"));
        }
        if self.service.address.trim().is_empty() {
            return Err(DiscoveryError::configuration("service address is required"));
        }
        if self.service.port == 0 {
            return Err(DiscoveryError::configuration("service port is required"));
        }
        if self.registry.endpoints.is_empty() {
            return Err(DiscoveryError::configuration(
                "registry endpoints are required",
            ));
        }
        Ok(())
    }
}

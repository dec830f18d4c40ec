//! Consul 服务注册发现实现
//!
//! 健康检查模型：注册时附带主动探测（HTTP / TCP）或 TTL 检查，
//! 实例状态由节点上全部检查聚合得出；启用心跳且为 TTL 检查时，
//! 周期调用 check pass 接口续期。

use crate::config::{CheckType, Config, DiscoveryOptions, HeartbeatOptions};
use crate::error::{DiscoveryError, Result};
use crate::instance::{ServiceInstance, ServiceStatus};
use crate::registry::backend::{ChangeEvent, CoordinationClient};
use crate::registry::heartbeat::{HeartbeatTask, TtlScheduler};
use crate::registry::registration::Registration;
use crate::registry::trait_def::ServiceRegistry;
use crate::store::ServiceStore;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 注册重试次数与固定退避
const MAX_REGISTER_ATTEMPTS: usize = 5;
const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// 连接等待轮询
const CONNECT_WAIT_ATTEMPTS: usize = 30;
const CONNECT_WAIT_DELAY: Duration = Duration::from_secs(1);

/// 阻塞查询参数与轮询节奏
const BLOCKING_WAIT: &str = "300s";
const BLOCKING_TIMEOUT: Duration = Duration::from_secs(330);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const WATCH_POLL_DELAY: Duration = Duration::from_millis(500);
const WATCH_ERROR_DELAY: Duration = Duration::from_secs(3);

// ============================================================
// Agent API 负载
// ============================================================

/// 注册负载（Consul agent service register 格式）
#[allow(non_snake_case)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentService {
    pub ID: String,
    pub Name: String,
    pub Tags: Vec<String>,
    pub Address: String,
    pub Port: u16,
    pub Meta: HashMap<String, String>,
    pub Check: AgentCheck,
}

/// 检查定义
#[allow(non_snake_case)]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCheck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub Name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub Notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub HTTP: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub TCP: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub TTL: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub Interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub Timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub TLSSkipVerify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub DeregisterCriticalServiceAfter: Option<String>,
}

/// 健康查询响应条目
#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct HealthEntry {
    Node: HealthNode,
    Service: HealthService,
    #[serde(default)]
    Checks: Vec<HealthCheck>,
}

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct HealthNode {
    Node: String,
}

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct HealthService {
    ID: String,
    Service: String,
    Address: String,
    Port: u16,
    #[serde(default)]
    Tags: Vec<String>,
    #[serde(default)]
    Meta: HashMap<String, String>,
}

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct HealthCheck {
    Status: String,
}

/// 聚合节点上全部检查的状态
///
/// 任一 critical 即 critical，否则任一 warning 即 warning，全部通过才是 passing；
/// 没有任何检查的节点保持 critical。
pub fn aggregate_check_status(statuses: &[ServiceStatus]) -> ServiceStatus {
    if statuses.is_empty() {
        return ServiceStatus::Critical;
    }
    if statuses.iter().any(|s| *s == ServiceStatus::Critical) {
        ServiceStatus::Critical
    } else if statuses.iter().any(|s| *s == ServiceStatus::Warning) {
        ServiceStatus::Warning
    } else {
        ServiceStatus::Passing
    }
}

/// 健康查询条目 → 服务实例
///
/// 单条解析失败只跳过该条并告警，不影响同批次的其余节点。
pub fn health_entries_to_instances(entries: &[serde_json::Value]) -> Vec<ServiceInstance> {
    let mut instances = Vec::new();
    for entry in entries {
        let entry: HealthEntry = match serde_json::from_value(entry.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping malformed consul health entry: {}", e);
                continue;
            }
        };

        let statuses: Vec<ServiceStatus> = entry
            .Checks
            .iter()
            .map(|check| ServiceStatus::parse(&check.Status))
            .collect();
        let status = aggregate_check_status(&statuses);
        let secure = entry
            .Service
            .Meta
            .get("secure")
            .map(|v| v == "true")
            .unwrap_or(false);

        let mut instance = ServiceInstance::new(
            entry.Service.Service,
            entry.Service.ID,
            entry.Service.Address,
            entry.Service.Port,
        )
        .with_secure(secure)
        .with_tags(entry.Service.Tags)
        .with_node_id(entry.Node.Node)
        .with_status(status);
        instance.metadata = entry.Service.Meta;
        instances.push(instance);
    }
    instances
}

// ============================================================
// HTTP 客户端
// ============================================================

/// Consul HTTP 客户端
#[derive(Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
    acl_token: Option<String>,
    connected: Arc<AtomicBool>,
}

impl ConsulClient {
    pub fn new(endpoints: &[String], acl_token: Option<String>) -> Result<Self> {
        let base_url = endpoints
            .first()
            .ok_or_else(|| DiscoveryError::configuration("no consul endpoint provided"))?
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            acl_token,
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_token(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.acl_token {
            Some(token) => request.query(&[("token", token.as_str())]),
            None => request,
        }
    }

    /// 探测 agent 可达性，同时更新 connected 标志
    pub async fn ping(&self) -> Result<()> {
        let result = self
            .with_token(self.http.get(self.url("/v1/status/leader")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        self.connected.store(result.is_ok(), Ordering::Relaxed);
        result?;
        Ok(())
    }

    /// 注册服务
    pub async fn register_service(&self, service: &AgentService) -> Result<()> {
        self.with_token(self.http.put(self.url("/v1/agent/service/register")))
            .timeout(REQUEST_TIMEOUT)
            .json(service)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| DiscoveryError::connectivity(format!("consul register failed: {e}")))?;
        Ok(())
    }

    /// 注销服务
    pub async fn deregister_service(&self, service_id: &str) -> Result<()> {
        self.with_token(
            self.http
                .put(self.url(&format!("/v1/agent/service/deregister/{service_id}"))),
        )
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()
        .map_err(|e| DiscoveryError::connectivity(format!("consul deregister failed: {e}")))?;
        Ok(())
    }

    /// TTL 检查续期
    pub async fn check_pass(&self, check_id: &str) -> Result<()> {
        self.with_token(
            self.http
                .put(self.url(&format!("/v1/agent/check/pass/{check_id}"))),
        )
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()
        .map_err(|e| DiscoveryError::transient(format!("consul check pass failed: {e}")))?;
        Ok(())
    }

    /// 枚举目录下的服务名（阻塞查询）
    ///
    /// 返回服务名表和新的修改序号；`index` 为 0 时立即返回当前状态。
    pub async fn list_services(&self, index: u64) -> Result<(HashMap<String, Vec<String>>, u64)> {
        let mut request = self.with_token(self.http.get(self.url("/v1/catalog/services")));
        request = if index > 0 {
            request
                .query(&[("index", index.to_string()), ("wait", BLOCKING_WAIT.into())])
                .timeout(BLOCKING_TIMEOUT)
        } else {
            request.timeout(REQUEST_TIMEOUT)
        };

        let response = request.send().await?.error_for_status()?;
        let new_index = consul_index(&response);
        let services = response.json::<HashMap<String, Vec<String>>>().await?;
        Ok((services, new_index))
    }

    /// 查询某服务的健康节点（阻塞查询），返回原始条目用于宽松解析
    pub async fn health_service(
        &self,
        service: &str,
        index: u64,
    ) -> Result<(Vec<serde_json::Value>, u64)> {
        let mut request = self.with_token(
            self.http
                .get(self.url(&format!("/v1/health/service/{service}"))),
        );
        request = if index > 0 {
            request
                .query(&[("index", index.to_string()), ("wait", BLOCKING_WAIT.into())])
                .timeout(BLOCKING_TIMEOUT)
        } else {
            request.timeout(REQUEST_TIMEOUT)
        };

        let response = request.send().await?.error_for_status()?;
        let new_index = consul_index(&response);
        let entries = response.json::<Vec<serde_json::Value>>().await?;
        Ok((entries, new_index))
    }

    /// 针对单个服务的健康 watch 循环
    fn spawn_health_watch(&self, service: String, tx: mpsc::Sender<ChangeEvent>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut index: u64 = 0;
            loop {
                match client.health_service(&service, index).await {
                    Ok((entries, new_index)) => {
                        if index == 0 || new_index != index {
                            let payload = match serde_json::to_vec(&entries) {
                                Ok(payload) => payload,
                                Err(e) => {
                                    warn!("failed to encode health entries for {service}: {e}");
                                    continue;
                                }
                            };
                            let event = ChangeEvent::Put {
                                id: service.clone(),
                                payload,
                            };
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        index = if new_index < index { 0 } else { new_index.max(1) };
                    }
                    Err(e) => {
                        warn!("consul health watch error for {service}: {e}");
                        tokio::time::sleep(WATCH_ERROR_DELAY).await;
                    }
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(WATCH_POLL_DELAY).await;
            }
        })
    }
}

#[async_trait]
impl CoordinationClient for ConsulClient {
    async fn create_or_update_registration(&self, _id: &str, payload: Vec<u8>) -> Result<()> {
        let service: AgentService = serde_json::from_slice(&payload)?;
        self.register_service(&service).await
    }

    async fn delete_registration(&self, id: &str) -> Result<()> {
        self.deregister_service(id).await
    }

    async fn list_children(&self, _namespace: &str) -> Result<Vec<String>> {
        let (services, _) = self.list_services(0).await?;
        Ok(services
            .into_keys()
            .filter(|name| name != "consul")
            .collect())
    }

    async fn read_payload(&self, id: &str) -> Result<Vec<u8>> {
        let (entries, _) = self.health_service(id, 0).await?;
        Ok(serde_json::to_vec(&entries)?)
    }

    async fn renew_liveness(&self, id: &str) -> Result<()> {
        self.check_pass(id).await
    }

    /// 目录级 watch：发现新服务时为其启动健康 watch，服务消失时发出删除事件
    async fn subscribe_to_changes(&self, _namespace: &str) -> Result<mpsc::Receiver<ChangeEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.clone();

        tokio::spawn(async move {
            let mut index: u64 = 0;
            let mut watchers: HashMap<String, JoinHandle<()>> = HashMap::new();

            loop {
                match client.list_services(index).await {
                    Ok((services, new_index)) => {
                        client.connected.store(true, Ordering::Relaxed);
                        // consul 自身也出现在目录里，跳过
                        let names: HashSet<String> = services
                            .into_keys()
                            .filter(|name| name != "consul")
                            .collect();

                        for name in &names {
                            if !watchers.contains_key(name) {
                                let handle =
                                    client.spawn_health_watch(name.clone(), tx.clone());
                                watchers.insert(name.clone(), handle);
                            }
                        }

                        let gone: Vec<String> = watchers
                            .keys()
                            .filter(|name| !names.contains(*name))
                            .cloned()
                            .collect();
                        for name in gone {
                            if let Some(handle) = watchers.remove(&name) {
                                handle.abort();
                            }
                            if tx.send(ChangeEvent::Delete { id: name }).await.is_err() {
                                break;
                            }
                        }

                        index = if new_index < index { 0 } else { new_index.max(1) };
                    }
                    Err(e) => {
                        client.connected.store(false, Ordering::Relaxed);
                        warn!("failed to list consul services: {e}");
                        tokio::time::sleep(WATCH_ERROR_DELAY).await;
                    }
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(WATCH_POLL_DELAY).await;
            }

            for (_, handle) in watchers {
                handle.abort();
            }
        });

        Ok(rx)
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

fn consul_index(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get("X-Consul-Index")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

// ============================================================
// 注册描述符
// ============================================================

/// Consul 注册描述符
#[derive(Debug, Clone)]
pub struct ConsulRegistration {
    service: AgentService,
}

impl ConsulRegistration {
    pub fn service(&self) -> &AgentService {
        &self.service
    }

    /// 检查是否为 TTL 类型（需要客户端主动续期）
    pub fn has_ttl_check(&self) -> bool {
        self.service.Check.TTL.is_some()
    }
}

impl Registration for ConsulRegistration {
    fn instance_id(&self) -> &str {
        &self.service.ID
    }

    fn service_id(&self) -> &str {
        &self.service.Name
    }

    fn to_instance(&self) -> ServiceInstance {
        let secure = self
            .service
            .Meta
            .get("secure")
            .map(|v| v == "true")
            .unwrap_or(false);
        let mut instance = ServiceInstance::new(
            self.service.Name.clone(),
            self.service.ID.clone(),
            self.service.Address.clone(),
            self.service.Port,
        )
        .with_secure(secure)
        .with_tags(self.service.Tags.clone());
        instance.metadata = self.service.Meta.clone();
        instance
    }
}

/// Consul 注册描述符构建器
///
/// 校验必填字段并合成实例 id、标签与元数据；
/// 实例 id 未指定时生成 `{服务名}-{uuid}`，指定时追加版本后缀。
#[derive(Debug, Default)]
pub struct ConsulRegistrationBuilder {
    service_name: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    version: Option<String>,
    domain: Option<String>,
    tags: Vec<String>,
    metadata: HashMap<String, String>,
    instance_id: Option<String>,
    discovery: Option<DiscoveryOptions>,
    heartbeat: Option<HeartbeatOptions>,
}

impl ConsulRegistrationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn instance_id(mut self, id: Option<String>) -> Self {
        self.instance_id = id.filter(|id| !id.is_empty());
        self
    }

    pub fn discovery_options(mut self, options: DiscoveryOptions) -> Self {
        self.discovery = Some(options);
        self
    }

    pub fn heartbeat_options(mut self, options: HeartbeatOptions) -> Self {
        self.heartbeat = Some(options);
        self
    }

    pub fn build(self) -> Result<ConsulRegistration> {
        let service_name = self
            .service_name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| DiscoveryError::configuration("service name is required"))?;
        let host = self
            .host
            .filter(|host| !host.trim().is_empty())
            .ok_or_else(|| DiscoveryError::configuration("service address is required"))?;
        let port = self
            .port
            .filter(|port| *port != 0)
            .ok_or_else(|| DiscoveryError::configuration("service port is required"))?;
        let discovery = self
            .discovery
            .ok_or_else(|| DiscoveryError::configuration("discovery options are required"))?;
        let heartbeat = self
            .heartbeat
            .ok_or_else(|| DiscoveryError::configuration("heartbeat options are required"))?;

        let version = self.version.unwrap_or_else(|| "latest".to_string());
        let domain = self.domain.unwrap_or_else(|| "flare".to_string());
        let instance_id = match self.instance_id {
            Some(id) => format!("{id}-{version}"),
            None => format!("{}-{}", service_name, uuid::Uuid::new_v4()),
        };

        let mut tags = vec!["service".to_string(), version.clone()];
        tags.extend(self.tags);

        let mut meta = HashMap::new();
        meta.insert("domain".to_string(), domain);
        meta.insert("secure".to_string(), discovery.is_secure().to_string());
        meta.insert("version".to_string(), version);
        meta.extend(self.metadata);

        let check = build_check(&service_name, &discovery, &heartbeat)?;

        Ok(ConsulRegistration {
            service: AgentService {
                ID: instance_id,
                Name: service_name,
                Tags: tags,
                Address: host,
                Port: port,
                Meta: meta,
                Check: check,
            },
        })
    }
}

fn build_check(
    service_name: &str,
    discovery: &DiscoveryOptions,
    heartbeat: &HeartbeatOptions,
) -> Result<AgentCheck> {
    let mut check = AgentCheck {
        Name: Some(format!("{service_name} Status")),
        Notes: discovery.notes.clone(),
        DeregisterCriticalServiceAfter: discovery.deregister_critical_after.clone(),
        ..AgentCheck::default()
    };

    match discovery.check_type {
        CheckType::Http => {
            let endpoint = discovery.health_endpoint.clone().ok_or_else(|| {
                DiscoveryError::configuration("health endpoint is required for http check")
            })?;
            check.HTTP = Some(endpoint);
            check.Interval = Some(format!("{}s", discovery.interval));
            check.Timeout = Some(format!("{}s", discovery.timeout));
            check.TLSSkipVerify = Some(discovery.skip_verify_tls);
        }
        CheckType::Tcp => {
            let target = discovery.tcp_target.clone().ok_or_else(|| {
                DiscoveryError::configuration("tcp target is required for tcp check")
            })?;
            check.TCP = Some(target);
            check.Interval = Some(format!("{}s", discovery.interval));
            check.Timeout = Some(format!("{}s", discovery.timeout));
        }
        CheckType::Ttl => {
            check.TTL = Some(format!("{}s", heartbeat.ttl()));
        }
    }

    Ok(check)
}

// ============================================================
// 注册中心
// ============================================================

/// Consul 服务注册中心
pub struct ConsulRegistry {
    client: Arc<ConsulClient>,
    config: Config,
    store: Arc<ServiceStore>,
    registration: RwLock<Option<Arc<ConsulRegistration>>>,
    ttl_scheduler: Mutex<Option<Arc<TtlScheduler>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsulRegistry {
    pub fn new(config: Config, store: Arc<ServiceStore>) -> Result<Self> {
        let client = ConsulClient::new(
            &config.registry.endpoints,
            config.registry.acl_token.clone(),
        )?;
        Ok(Self {
            client: Arc::new(client),
            config,
            store,
            registration: RwLock::new(None),
            ttl_scheduler: Mutex::new(None),
            watch_task: Mutex::new(None),
        })
    }

    pub fn client(&self) -> Arc<ConsulClient> {
        self.client.clone()
    }

    async fn wait_for_connection(&self) -> Result<()> {
        for attempt in 1..=CONNECT_WAIT_ATTEMPTS {
            if self.client.ping().await.is_ok() {
                info!("consul connected, proceeding with registration");
                return Ok(());
            }
            info!(
                "waiting for consul connection... (attempt {attempt}/{CONNECT_WAIT_ATTEMPTS})"
            );
            tokio::time::sleep(CONNECT_WAIT_DELAY).await;
        }
        Err(DiscoveryError::connectivity(
            "failed to connect to consul within timeout period",
        ))
    }

    fn fail_fast(&self) -> bool {
        self.config
            .discovery
            .as_ref()
            .map(|d| d.fail_fast)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn init(&self) -> Result<()> {
        self.config.validate_for_registration()?;
        // validate_for_registration 保证两者存在
        let discovery = self
            .config
            .discovery
            .clone()
            .ok_or_else(|| DiscoveryError::configuration("discovery options are required"))?;
        let heartbeat = self
            .config
            .heartbeat
            .clone()
            .ok_or_else(|| DiscoveryError::configuration("heartbeat options are required"))?;

        self.wait_for_connection().await?;

        let registration = ConsulRegistrationBuilder::new()
            .discovery_options(discovery)
            .heartbeat_options(heartbeat.clone())
            .service_name(self.config.service.name.clone())
            .host(self.config.service.address.clone())
            .port(self.config.service.port)
            .tags(self.config.service.tags.clone())
            .metadata(self.config.service.metadata.clone())
            .version(self.config.service.version.clone())
            .domain(self.config.service.domain.clone())
            .instance_id(self.config.service.id.clone())
            .build()?;
        let registration = Arc::new(registration);

        if heartbeat.enabled {
            let task = HeartbeatTask::new(
                self.client.clone() as Arc<dyn CoordinationClient>,
                registration.instance_id(),
            );
            *self.ttl_scheduler.lock() = Some(Arc::new(TtlScheduler::new(heartbeat, task)));
        }

        *self.registration.write() = Some(registration);
        Ok(())
    }

    async fn register(&self) -> Result<()> {
        let registration = self
            .registration
            .read()
            .clone()
            .ok_or_else(|| DiscoveryError::configuration("registry is not initialized"))?;

        info!(
            "registering service with id: {}",
            registration.instance_id()
        );

        let mut last_error = None;
        for attempt in 1..=MAX_REGISTER_ATTEMPTS {
            match self.client.register_service(registration.service()).await {
                Ok(()) => {
                    info!("service registered");
                    // TTL 检查没有外部探测，由心跳调度器主动续期
                    if registration.has_ttl_check() {
                        if let Some(scheduler) = self.ttl_scheduler.lock().as_ref() {
                            scheduler.add(registration.instance_id());
                        }
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "consul registration error (attempt {attempt}/{MAX_REGISTER_ATTEMPTS}): {e}"
                    );
                    last_error = Some(e);
                    if attempt < MAX_REGISTER_ATTEMPTS {
                        tokio::time::sleep(REGISTER_RETRY_DELAY).await;
                    }
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| DiscoveryError::connectivity("consul registration failed"));
        if self.fail_fast() {
            Err(error)
        } else {
            warn!("fail fast is false, continuing without consul registration: {error}");
            Ok(())
        }
    }

    async fn deregister(&self) {
        let Some(registration) = self.registration.read().clone() else {
            return;
        };
        info!(
            "deregistering service with consul: {}",
            registration.instance_id()
        );

        if let Some(scheduler) = self.ttl_scheduler.lock().as_ref() {
            scheduler.remove(registration.instance_id());
        }
        self.store
            .remove_service_node(registration.service_id(), registration.instance_id());

        match self
            .client
            .deregister_service(registration.instance_id())
            .await
        {
            Ok(()) => info!(
                "deregistered service with consul: {}",
                registration.instance_id()
            ),
            Err(e) => error!("failed to deregister service from consul: {e}"),
        }
    }

    async fn watch_all(&self) -> Result<()> {
        let mut rx = self
            .client
            .subscribe_to_changes(&self.config.registry.namespace)
            .await?;
        let store = self.store.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ChangeEvent::Put { id, payload } => {
                        match serde_json::from_slice::<Vec<serde_json::Value>>(&payload) {
                            Ok(entries) => {
                                let instances = health_entries_to_instances(&entries);
                                store.set_services(&id, instances);
                            }
                            Err(e) => {
                                warn!("failed to parse consul health payload for {id}: {e}")
                            }
                        }
                    }
                    ChangeEvent::Delete { id } => store.remove_service(&id),
                }
            }
        });

        if let Some(old) = self.watch_task.lock().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(handle) = self.watch_task.lock().take() {
            handle.abort();
        }
        // 调度器在 drop 时中止全部心跳任务
        self.ttl_scheduler.lock().take();
    }

    fn instance_id(&self) -> Option<String> {
        self.registration
            .read()
            .as_ref()
            .map(|r| r.instance_id().to_string())
    }
}

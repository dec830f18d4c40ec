//! etcd 服务注册发现实现
//!
//! 临时节点模型：在固定命名空间前缀下创建 `<namespace>/<instanceId>` 节点，
//! 负载为序列化的实例描述符，节点挂在租约上，存活完全由节点存在性表达。
//! 发现端枚举前缀下的子节点并读取各自负载；重连后的重复注册是幂等覆盖。

use crate::config::Config;
use crate::error::{DiscoveryError, Result};
use crate::instance::{ServiceInstance, ServiceStatus};
use crate::registry::backend::{ChangeEvent, CoordinationClient};
use crate::registry::heartbeat::{HeartbeatTask, TtlScheduler};
use crate::registry::registration::Registration;
use crate::registry::trait_def::ServiceRegistry;
use crate::store::ServiceStore;
use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
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

/// watch 流中断后的重建间隔
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(3);

// ============================================================
// 客户端
// ============================================================

/// etcd 客户端
///
/// 租约承载节点存活：注册写入挂在租约上，存活续期即租约续期。
#[derive(Clone)]
pub struct EtcdClient {
    client: Client,
    namespace: String,
    ttl: u64,
    lease_id: Arc<AtomicI64>,
    connected: Arc<AtomicBool>,
}

impl EtcdClient {
    pub async fn connect(endpoints: &[String], namespace: &str, ttl: u64) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| DiscoveryError::connectivity(format!("failed to connect to etcd: {e}")))?;

        Ok(Self {
            client,
            namespace: namespace.trim_end_matches('/').to_string(),
            ttl,
            lease_id: Arc::new(AtomicI64::new(0)),
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    fn key(&self, instance_id: &str) -> String {
        format!("{}/{}", self.namespace, instance_id)
    }

    fn prefix(&self) -> String {
        format!("{}/", self.namespace)
    }

    /// 取出节点 id（键去掉命名空间前缀）
    fn child_id(&self, key: &[u8]) -> String {
        let key = String::from_utf8_lossy(key);
        key.strip_prefix(&self.prefix())
            .unwrap_or(&key)
            .to_string()
    }

    /// 确保存在一个有效租约
    async fn ensure_lease(&self) -> Result<i64> {
        let current = self.lease_id.load(Ordering::Relaxed);
        if current != 0 {
            return Ok(current);
        }
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(self.ttl as i64, None)
            .await
            .map_err(|e| DiscoveryError::connectivity(format!("failed to grant lease: {e}")))?;
        self.lease_id.store(lease.id(), Ordering::Relaxed);
        Ok(lease.id())
    }
}

#[async_trait]
impl CoordinationClient for EtcdClient {
    /// 幂等写入：节点已存在时覆盖，重连后的重复注册不是错误
    async fn create_or_update_registration(&self, id: &str, payload: Vec<u8>) -> Result<()> {
        let lease_id = self.ensure_lease().await?;
        let mut client = self.client.clone();
        let options = PutOptions::new().with_lease(lease_id);
        client
            .put(self.key(id), payload, Some(options))
            .await
            .map_err(|e| {
                self.connected.store(false, Ordering::Relaxed);
                DiscoveryError::connectivity(format!("failed to register service: {e}"))
            })?;
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn delete_registration(&self, id: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(self.key(id), None)
            .await
            .map_err(|e| DiscoveryError::connectivity(format!("failed to delete node: {e}")))?;

        // 注销后租约不再需要，尽力回收
        let lease_id = self.lease_id.swap(0, Ordering::Relaxed);
        if lease_id != 0 {
            if let Err(e) = client.lease_revoke(lease_id).await {
                warn!("failed to revoke lease {lease_id}: {e}");
            }
        }
        Ok(())
    }

    /// 枚举命名空间下的节点 id；命名空间尚不存在时返回空集而不是错误
    async fn list_children(&self, _namespace: &str) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let options = GetOptions::new().with_prefix().with_keys_only();
        let response = client
            .get(self.prefix(), Some(options))
            .await
            .map_err(|e| DiscoveryError::transient(format!("failed to list children: {e}")))?;

        Ok(response
            .kvs()
            .iter()
            .map(|kv| self.child_id(kv.key()))
            .collect())
    }

    async fn read_payload(&self, id: &str) -> Result<Vec<u8>> {
        let mut client = self.client.clone();
        let response = client
            .get(self.key(id), None)
            .await
            .map_err(|e| DiscoveryError::transient(format!("failed to read node {id}: {e}")))?;
        response
            .kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .ok_or_else(|| DiscoveryError::transient(format!("node {id} does not exist")))
    }

    /// 租约续期一次
    async fn renew_liveness(&self, _id: &str) -> Result<()> {
        let lease_id = self.lease_id.load(Ordering::Relaxed);
        if lease_id == 0 {
            return Err(DiscoveryError::transient("no active lease to renew"));
        }
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| DiscoveryError::transient(format!("lease keep-alive failed: {e}")))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| DiscoveryError::transient(format!("lease keep-alive failed: {e}")))?;
        stream
            .message()
            .await
            .map_err(|e| DiscoveryError::transient(format!("lease keep-alive failed: {e}")))?;
        Ok(())
    }

    /// 前缀 watch；流结束时关闭通道，由调用方重建订阅
    async fn subscribe_to_changes(&self, _namespace: &str) -> Result<mpsc::Receiver<ChangeEvent>> {
        let mut client = self.client.clone();
        let options = WatchOptions::new().with_prefix();
        let (_watcher, mut stream) = client
            .watch(self.prefix(), Some(options))
            .await
            .map_err(|e| DiscoveryError::connectivity(format!("failed to watch prefix: {e}")))?;

        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        tokio::spawn(async move {
            // _watcher 随任务存活，保持订阅不被取消
            let _watcher = _watcher;
            loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        for event in response.events() {
                            let Some(kv) = event.kv() else { continue };
                            let id = this.child_id(kv.key());
                            let change = if event.event_type() == EventType::Delete {
                                ChangeEvent::Delete { id }
                            } else {
                                ChangeEvent::Put {
                                    id,
                                    payload: kv.value().to_vec(),
                                }
                            };
                            if tx.send(change).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("etcd watch stream closed");
                        this.connected.store(false, Ordering::Relaxed);
                        return;
                    }
                    Err(e) => {
                        warn!("etcd watch stream error: {e}");
                        this.connected.store(false, Ordering::Relaxed);
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

// ============================================================
// 注册描述符
// ============================================================

/// etcd 注册描述符：节点负载就是序列化的实例
#[derive(Debug, Clone)]
pub struct EtcdRegistration {
    instance: ServiceInstance,
}

impl EtcdRegistration {
    pub fn payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.instance)?)
    }
}

impl Registration for EtcdRegistration {
    fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }

    fn service_id(&self) -> &str {
        &self.instance.service_id
    }

    fn to_instance(&self) -> ServiceInstance {
        self.instance.clone()
    }
}

/// etcd 注册描述符构建器
#[derive(Debug, Default)]
pub struct EtcdRegistrationBuilder {
    service_name: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    version: Option<String>,
    domain: Option<String>,
    tags: Vec<String>,
    metadata: HashMap<String, String>,
    instance_id: Option<String>,
    status: Option<String>,
    secure: bool,
}

impl EtcdRegistrationBuilder {
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

    pub fn status(mut self, status: Option<String>) -> Self {
        self.status = status;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn build(self) -> Result<EtcdRegistration> {
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

        let version = self.version.unwrap_or_else(|| "latest".to_string());
        let domain = self.domain.unwrap_or_else(|| "flare".to_string());
        let instance_id = match self.instance_id {
            Some(id) => format!("{id}-{version}"),
            None => format!("{}-{}", service_name, uuid::Uuid::new_v4()),
        };

        let mut tags = vec!["service".to_string(), version.clone()];
        tags.extend(self.tags);

        let mut metadata = HashMap::new();
        metadata.insert("domain".to_string(), domain);
        metadata.insert("secure".to_string(), self.secure.to_string());
        metadata.insert("version".to_string(), version);
        metadata.extend(self.metadata);

        // 临时节点没有检查对象：节点存在即视为 passing
        let status = self
            .status
            .as_deref()
            .map(ServiceStatus::parse)
            .unwrap_or(ServiceStatus::Passing);

        let mut instance = ServiceInstance::new(service_name, instance_id, host, port)
            .with_secure(self.secure)
            .with_tags(tags)
            .with_status(status);
        instance.metadata = metadata;

        Ok(EtcdRegistration { instance })
    }
}

// ============================================================
// 注册中心
// ============================================================

/// etcd 服务注册中心
pub struct EtcdRegistry {
    client: Arc<EtcdClient>,
    config: Config,
    store: Arc<ServiceStore>,
    registration: RwLock<Option<Arc<EtcdRegistration>>>,
    ttl_scheduler: Mutex<Option<Arc<TtlScheduler>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdRegistry {
    pub async fn new(config: Config, store: Arc<ServiceStore>) -> Result<Self> {
        let ttl = config.heartbeat.as_ref().map(|h| h.ttl()).unwrap_or(30);
        let client = EtcdClient::connect(
            &config.registry.endpoints,
            &config.registry.namespace,
            ttl,
        )
        .await?;
        Ok(Self {
            client: Arc::new(client),
            config,
            store,
            registration: RwLock::new(None),
            ttl_scheduler: Mutex::new(None),
            watch_task: Mutex::new(None),
        })
    }

    pub fn client(&self) -> Arc<EtcdClient> {
        self.client.clone()
    }

    async fn wait_for_connection(&self) -> Result<()> {
        for attempt in 1..=CONNECT_WAIT_ATTEMPTS {
            if self.client.connected() {
                return Ok(());
            }
            info!("waiting for etcd connection... (attempt {attempt}/{CONNECT_WAIT_ATTEMPTS})");
            tokio::time::sleep(CONNECT_WAIT_DELAY).await;
        }
        Err(DiscoveryError::connectivity(
            "failed to connect to etcd within timeout period",
        ))
    }

    fn fail_fast(&self) -> bool {
        self.config
            .discovery
            .as_ref()
            .map(|d| d.fail_fast)
            .unwrap_or(false)
    }

    /// 全量重同步：枚举全部节点、读取负载并按服务名分组替换进缓存
    ///
    /// 单个节点负载损坏只跳过该节点，不影响同批次其余节点。
    async fn resync(client: &EtcdClient, store: &ServiceStore, known: &mut HashMap<String, String>) {
        let children = match client.list_children("").await {
            Ok(children) => children,
            Err(e) => {
                warn!("failed to list etcd service nodes: {e}");
                return;
            }
        };

        let mut grouped: HashMap<String, Vec<ServiceInstance>> = HashMap::new();
        let mut seen = HashMap::new();
        for child in children {
            let payload = match client.read_payload(&child).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to read etcd node {child}: {e}");
                    continue;
                }
            };
            match serde_json::from_slice::<ServiceInstance>(&payload) {
                Ok(instance) => {
                    seen.insert(child, instance.service_id.clone());
                    grouped
                        .entry(instance.service_id.clone())
                        .or_default()
                        .push(instance);
                }
                Err(e) => {
                    warn!("skipping malformed etcd node {child}: {e}");
                }
            }
        }

        // 已消失的服务从缓存移除
        let gone: Vec<String> = known
            .values()
            .filter(|name| !grouped.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            store.remove_service(&name);
        }

        for (name, instances) in grouped {
            store.set_services(&name, instances);
        }
        *known = seen;
    }
}

#[async_trait]
impl ServiceRegistry for EtcdRegistry {
    async fn init(&self) -> Result<()> {
        self.config.validate_for_registration()?;
        let heartbeat = self
            .config
            .heartbeat
            .clone()
            .ok_or_else(|| DiscoveryError::configuration("heartbeat options are required"))?;

        self.wait_for_connection().await?;

        let registration = EtcdRegistrationBuilder::new()
            .service_name(self.config.service.name.clone())
            .host(self.config.service.address.clone())
            .port(self.config.service.port)
            .tags(self.config.service.tags.clone())
            .metadata(self.config.service.metadata.clone())
            .version(self.config.service.version.clone())
            .domain(self.config.service.domain.clone())
            .instance_id(self.config.service.id.clone())
            .status(self.config.service.status.clone())
            .secure(
                self.config
                    .discovery
                    .as_ref()
                    .map(|d| d.is_secure())
                    .unwrap_or(false),
            )
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
        let payload = registration.payload()?;

        let mut last_error = None;
        for attempt in 1..=MAX_REGISTER_ATTEMPTS {
            match self
                .client
                .create_or_update_registration(registration.instance_id(), payload.clone())
                .await
            {
                Ok(()) => {
                    info!("service registered");
                    if let Some(scheduler) = self.ttl_scheduler.lock().as_ref() {
                        scheduler.add(registration.instance_id());
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "etcd registration error (attempt {attempt}/{MAX_REGISTER_ATTEMPTS}): {e}"
                    );
                    last_error = Some(e);
                    if attempt < MAX_REGISTER_ATTEMPTS {
                        tokio::time::sleep(REGISTER_RETRY_DELAY).await;
                    }
                }
            }
        }

        let error =
            last_error.unwrap_or_else(|| DiscoveryError::connectivity("etcd registration failed"));
        if self.fail_fast() {
            Err(error)
        } else {
            warn!("fail fast is false, continuing without etcd registration: {error}");
            Ok(())
        }
    }

    async fn deregister(&self) {
        let Some(registration) = self.registration.read().clone() else {
            return;
        };
        info!(
            "deregistering service with etcd: {}",
            registration.instance_id()
        );

        if let Some(scheduler) = self.ttl_scheduler.lock().as_ref() {
            scheduler.remove(registration.instance_id());
        }
        self.store
            .remove_service_node(registration.service_id(), registration.instance_id());

        match self
            .client
            .delete_registration(registration.instance_id())
            .await
        {
            Ok(()) => info!(
                "deregistered service with etcd: {}",
                registration.instance_id()
            ),
            Err(e) => error!("failed to deregister service from etcd: {e}"),
        }
    }

    /// 建立前缀订阅并持续同步到缓存
    ///
    /// watch 流中断后退避重建并全量重同步；重同步期间请求路径照常读取
    /// 当前缓存内容，不会被阻塞。
    async fn watch_all(&self) -> Result<()> {
        let client = self.client.clone();
        let store = self.store.clone();

        let handle = tokio::spawn(async move {
            // instance_id → service_id 的归属表，用于翻译删除事件
            let mut owners: HashMap<String, String> = HashMap::new();
            loop {
                match client.subscribe_to_changes("").await {
                    Ok(mut rx) => {
                        Self::resync(&client, &store, &mut owners).await;
                        while let Some(event) = rx.recv().await {
                            match event {
                                ChangeEvent::Put { id, payload } => {
                                    match serde_json::from_slice::<ServiceInstance>(&payload) {
                                        Ok(instance) => {
                                            let service = instance.service_id.clone();
                                            owners.insert(id, service.clone());
                                            store.add_service(&service, instance);
                                        }
                                        Err(e) => {
                                            warn!("skipping malformed etcd node {id}: {e}")
                                        }
                                    }
                                }
                                ChangeEvent::Delete { id } => {
                                    if let Some(service) = owners.remove(&id) {
                                        store.remove_service_node(&service, &id);
                                    }
                                }
                            }
                        }
                        warn!("etcd watch subscription lost, resubscribing");
                    }
                    Err(e) => {
                        warn!("failed to subscribe to etcd changes: {e}");
                    }
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
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
        self.ttl_scheduler.lock().take();
    }

    fn instance_id(&self) -> Option<String> {
        self.registration
            .read()
            .as_ref()
            .map(|r| r.instance_id().to_string())
    }
}

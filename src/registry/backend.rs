//! 协调后端边界
//!
//! 两种后端（健康检查模型 / 临时节点模型）的原生原语不同，
//! 但都以同一组抽象操作暴露：注册写入、节点枚举、负载读取、
//! 存活续期与变更订阅，外加一个 connected 状态标志。

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 后端推送的原始变更事件
///
/// `id` 的含义由后端决定：临时节点后端是实例 id，
/// 健康检查后端是服务名（负载为该服务的健康节点列表）。
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// 节点新增或更新
    Put { id: String, payload: Vec<u8> },
    /// 节点消失
    Delete { id: String },
}

/// 协调后端客户端
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// 创建或更新注册（负载为后端原生描述符的序列化形式）
    async fn create_or_update_registration(&self, id: &str, payload: Vec<u8>) -> Result<()>;

    /// 删除注册
    async fn delete_registration(&self, id: &str) -> Result<()>;

    /// 枚举命名空间下的节点 id
    async fn list_children(&self, namespace: &str) -> Result<Vec<String>>;

    /// 读取单个节点的负载
    async fn read_payload(&self, id: &str) -> Result<Vec<u8>>;

    /// 存活续期（健康检查后端为 check pass，临时节点后端为租约续期）
    async fn renew_liveness(&self, id: &str) -> Result<()>;

    /// 订阅命名空间下的节点变更
    ///
    /// 返回的通道关闭表示订阅中断，由调用方决定是否重建。
    async fn subscribe_to_changes(&self, namespace: &str) -> Result<mpsc::Receiver<ChangeEvent>>;

    /// 后端连接是否就绪
    fn connected(&self) -> bool;
}

//! 服务注册中心 Trait 定义

use crate::error::Result;
use async_trait::async_trait;

/// 服务注册中心
///
/// 状态机：`UNINITIALIZED → CONNECTING → REGISTERED → WATCHING`（稳态，
/// 心跳与 watch 并行）`→ DEREGISTERING → CLOSED`。两个后端实现同一套表面：
///
/// - `init` 校验配置并构建注册描述符，配置缺失直接失败，不重试
/// - `register` 按固定退避重试瞬时失败，耗尽后依 fail_fast 决定致命或降级
/// - `deregister` 尽力而为，错误只记录，绝不阻塞进程退出
/// - `watch_all` 订阅命名空间下全部服务节点并同步进 ServiceStore
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// 校验必填配置、构建注册描述符，并在启用心跳时准备 TTL 调度器
    async fn init(&self) -> Result<()>;

    /// 向后端提交注册
    async fn register(&self) -> Result<()>;

    /// 从后端移除注册（尽力而为）
    async fn deregister(&self);

    /// 建立（或重建）对全部服务节点的订阅
    async fn watch_all(&self) -> Result<()>;

    /// 停止 watch 与心跳任务
    async fn close(&self);

    /// 本进程的实例 id（init 之后可用）
    fn instance_id(&self) -> Option<String>;
}

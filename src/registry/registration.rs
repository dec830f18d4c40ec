//! 注册描述符

use crate::instance::ServiceInstance;

/// 提交给协调后端的注册描述符
///
/// 由各后端的 RegistrationBuilder 在启动时构建一次，之后不可变；
/// 崩溃重连后的重新注册复用同一描述符。
pub trait Registration: Send + Sync {
    /// 实例 id
    fn instance_id(&self) -> &str;

    /// 逻辑服务名
    fn service_id(&self) -> &str;

    /// 描述符对应的服务实例视图
    fn to_instance(&self) -> ServiceInstance;
}

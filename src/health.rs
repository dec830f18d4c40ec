//! 实例健康状态
//!
//! 每个实例持有一份可变的健康记录，由负载均衡执行包装器在调用前后更新，
//! 记录请求量、时延与失败信息，作为后续选择决策的输入。

use crate::instance::ServiceStatus;
use parking_lot::Mutex;

/// 活跃请求计数器的过期重置阈值（秒）
///
/// 崩溃的调用可能永远不会递减计数器，超过该阈值未变化的计数会被归零。
const DEFAULT_ACTIVE_REQUEST_TIMEOUT_SECS: i64 = 10;

#[derive(Debug)]
struct HealthState {
    status: ServiceStatus,
    total_requests: u64,
    active_requests: i64,
    weight: f64,
    fixed_weight: bool,
    response_time_avg: f64,
    response_time_max: f64,
    failure_count: u64,
    last_failure_time: Option<i64>,
    last_failure_message: String,
    first_connection_time: Option<i64>,
    last_active_change_time: i64,
    active_request_timeout_secs: i64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: ServiceStatus::Critical,
            total_requests: 0,
            active_requests: 0,
            weight: -1.0,
            fixed_weight: false,
            response_time_avg: 0.0,
            response_time_max: 0.0,
            failure_count: 0,
            last_failure_time: None,
            last_failure_message: String::new(),
            first_connection_time: None,
            last_active_change_time: 0,
            active_request_timeout_secs: DEFAULT_ACTIVE_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// 健康状态的只读快照
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: ServiceStatus,
    pub total_requests: u64,
    pub active_requests: i64,
    pub weight: f64,
    pub response_time_avg: f64,
    pub response_time_max: f64,
    pub failure_count: u64,
    pub last_failure_time: Option<i64>,
    pub last_failure_message: String,
    pub first_connection_time: Option<i64>,
}

/// 实例健康记录
///
/// 内部加锁，同一实例上的并发调用不会破坏滑动平均与活跃计数的不变量。
/// 初始状态为 critical，首次成功联通后转为 passing。
#[derive(Debug, Default)]
pub struct InstanceHealth {
    inner: Mutex<HealthState>,
}

impl InstanceHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// 固定权重模式：执行包装器不再根据时延调整 weight
    pub fn with_fixed_weight(fixed: bool) -> Self {
        let health = Self::default();
        health.inner.lock().fixed_weight = fixed;
        health
    }

    /// 设置活跃计数过期阈值（秒）
    pub fn set_active_request_timeout(&self, secs: i64) {
        self.inner.lock().active_request_timeout_secs = secs;
    }

    pub fn status(&self) -> ServiceStatus {
        self.inner.lock().status
    }

    pub fn set_status(&self, status: ServiceStatus) {
        self.inner.lock().status = status;
    }

    /// 是否健康（非 critical）
    pub fn is_healthy(&self) -> bool {
        self.status() != ServiceStatus::Critical
    }

    pub fn total_requests(&self) -> u64 {
        self.inner.lock().total_requests
    }

    pub fn weight(&self) -> f64 {
        self.inner.lock().weight
    }

    pub fn response_time_avg(&self) -> f64 {
        self.inner.lock().response_time_avg
    }

    pub fn response_time_max(&self) -> f64 {
        self.inner.lock().response_time_max
    }

    pub fn failure_count(&self) -> u64 {
        self.inner.lock().failure_count
    }

    pub fn last_failure(&self) -> Option<(i64, String)> {
        let state = self.inner.lock();
        state
            .last_failure_time
            .map(|ts| (ts, state.last_failure_message.clone()))
    }

    pub fn first_connection_time(&self) -> Option<i64> {
        self.inner.lock().first_connection_time
    }

    /// 当前活跃请求数（带过期归零）
    pub fn active_requests(&self) -> i64 {
        self.active_requests_at(now_millis())
    }

    /// 在给定时间点计算活跃请求数
    ///
    /// 计数器为负、或超过阈值未发生变化时重置为 0。
    pub fn active_requests_at(&self, now_ms: i64) -> i64 {
        let mut state = self.inner.lock();
        if state.active_requests == 0 {
            return 0;
        }
        let stale =
            now_ms - state.last_active_change_time > state.active_request_timeout_secs * 1000;
        if stale || state.active_requests < 0 {
            state.active_requests = 0;
            return 0;
        }
        state.active_requests
    }

    /// 请求开始：活跃数 +1
    pub fn increment_active_requests(&self) {
        let mut state = self.inner.lock();
        state.active_requests += 1;
        state.last_active_change_time = now_millis();
    }

    /// 请求结束：活跃数 -1（钳制在 0 以上）
    pub fn decrement_active_requests(&self) {
        let mut state = self.inner.lock();
        if state.active_requests > 0 {
            state.active_requests -= 1;
        } else {
            state.active_requests = 0;
        }
        state.last_active_change_time = now_millis();
    }

    /// 请求开始：累计请求数 +1
    pub fn increment_total_requests(&self) {
        self.inner.lock().total_requests += 1;
    }

    /// 首次联通时间，只记录一次
    pub fn set_first_connection_time(&self) {
        let mut state = self.inner.lock();
        if state.first_connection_time.is_none() {
            state.first_connection_time = Some(now_millis());
        }
    }

    /// 记录一次成功调用的耗时（毫秒）
    ///
    /// 滑动平均按 `avg' = (avg * (n - 1) + sample) / n` 计算，n 为累计请求数；
    /// 非固定权重模式下 weight 取本次耗时与均值的差，慢于自身均值的实例被惩罚。
    /// 成功联通意味着实例可用，状态转为 passing。
    pub fn record_response_time(&self, time_ms: f64) {
        let mut state = self.inner.lock();
        if !state.fixed_weight {
            state.weight = time_ms - state.response_time_avg;
        }
        let n = state.total_requests.max(1) as f64;
        state.response_time_avg = (state.response_time_avg * (n - 1.0) + time_ms) / n;
        state.response_time_max = state.response_time_max.max(time_ms);
        state.status = ServiceStatus::Passing;
    }

    /// 记录一次失败：失败数 +1，保存失败时间与原因，状态转为 critical
    pub fn mark_failed(&self, message: impl Into<String>) {
        let mut state = self.inner.lock();
        state.failure_count += 1;
        state.last_failure_time = Some(now_millis());
        state.last_failure_message = message.into();
        state.status = ServiceStatus::Critical;
    }

    /// 读取完整快照
    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.inner.lock();
        HealthSnapshot {
            status: state.status,
            total_requests: state.total_requests,
            active_requests: state.active_requests,
            weight: state.weight,
            response_time_avg: state.response_time_avg,
            response_time_max: state.response_time_max,
            failure_count: state.failure_count,
            last_failure_time: state.last_failure_time,
            last_failure_message: state.last_failure_message.clone(),
            first_connection_time: state.first_connection_time,
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

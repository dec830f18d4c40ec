//! 负载均衡模块
//!
//! 可插拔的实例选择策略与调用执行包装

pub mod client;
pub mod random;
pub mod round_robin;
pub mod strategy;
pub mod weighted;

pub use client::{ExecuteError, LoadBalancerClient};
pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;
pub use strategy::{SelectionStrategy, ServiceInstancePool, StrategyFactory, StrategyRegistry};
pub use weighted::WeightedResponseStrategy;

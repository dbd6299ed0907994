//! Warm-container pool and acquisition strategies.

mod pool;
mod strategy;
mod types;

pub use pool::{Pool, PoolError};
pub use strategy::{strategy_for, ColdStrategy, ContainerStrategy, WarmStrategy};
pub use types::{ContainerOptions, PoolConfig, StrategyKind};

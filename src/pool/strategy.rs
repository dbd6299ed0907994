//! Acquisition strategies: polymorphism over `(get, release)`.

use async_trait::async_trait;
use tracing::warn;

use crate::sandbox::{Container, SandboxError};

use super::pool::{Pool, PoolError};
use super::types::{ContainerOptions, StrategyKind};

/// Pluggable container acquisition policy. No state lives on a strategy.
#[async_trait]
pub trait ContainerStrategy: Send + Sync {
    fn name(&self) -> StrategyKind;

    async fn get(&self, pool: &Pool, opts: ContainerOptions) -> Result<Container, PoolError>;

    async fn release(&self, pool: &Pool, container: Container);
}

/// Reuse a pre-warmed pool container.
pub struct WarmStrategy;

#[async_trait]
impl ContainerStrategy for WarmStrategy {
    fn name(&self) -> StrategyKind {
        StrategyKind::Warm
    }

    async fn get(&self, pool: &Pool, _opts: ContainerOptions) -> Result<Container, PoolError> {
        pool.acquire().await
    }

    async fn release(&self, pool: &Pool, container: Container) {
        pool.release(container);
    }
}

/// Create a dedicated container with a host-bind workspace.
pub struct ColdStrategy;

#[async_trait]
impl ContainerStrategy for ColdStrategy {
    fn name(&self) -> StrategyKind {
        StrategyKind::Cold
    }

    async fn get(&self, pool: &Pool, opts: ContainerOptions) -> Result<Container, PoolError> {
        pool.create_cold_container(opts).await.map_err(Into::into)
    }

    async fn release(&self, _pool: &Pool, container: Container) {
        if let Err(err) = container.remove().await {
            if !matches!(err, SandboxError::ContainerNotFound) {
                warn!(container_id = %container.id, %err, "failed to remove cold container");
            }
        }
    }
}

/// Strategy object for a session's configured kind.
pub fn strategy_for(kind: StrategyKind) -> Box<dyn ContainerStrategy> {
    match kind {
        StrategyKind::Warm => Box::new(WarmStrategy),
        StrategyKind::Cold => Box::new(ColdStrategy),
    }
}

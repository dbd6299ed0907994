//! Concurrent warm-container pool.
//!
//! Capacity is governed by a token semaphore sized to `max_burst`: every
//! managed container — idle, leased, or in flight — is backed by exactly one
//! consumed token, so the number of free tokens is always
//! `max_burst - managed_count`. Every path that fails to materialise a
//! container rolls its reservation back (token returned, count decremented)
//! exactly once; a guard makes that hold even when an acquire future is
//! cancelled mid-flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use bollard::container::ListContainersOptions;
use bollard::Docker;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::monitor;
use crate::sandbox::{
    Container, ContainerConfig, SandboxError, AGENT_PORT, LABEL_MANAGED_BY, LABEL_PROJECT_ID,
    LABEL_SESSION_ID, MANAGED_BY_VALUE, POOL_PROJECT_ID,
};

use super::types::{ContainerOptions, PoolConfig};

/// Concurrent replenish creations.
const REPLENISH_CONCURRENCY: usize = 3;
/// Consecutive creation failures that open the circuit breaker.
const REPLENISH_FAILURE_LIMIT: u32 = 3;
/// How long replenishment stays suppressed after the breaker opens.
const REPLENISH_COOLDOWN: Duration = Duration::from_secs(60);
/// Budget for each replenish creation.
const REPLENISH_CREATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for the deferred stop+remove after a release.
const RELEASE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Cheap-clone handle to the pool; clones share all state.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    docker: Docker,
    config: PoolConfig,
    /// Warm, idle containers; popped LIFO.
    idle: Mutex<Vec<Container>>,
    /// All containers owned by the pool (idle + leased + in-flight-creating).
    managed_count: AtomicUsize,
    /// Replenishment is suppressed until this instant after repeated failures.
    cooldown_until: StdMutex<Option<Instant>>,
    /// Capacity tokens; one consumed per managed container.
    slots: Semaphore,
    stop: watch::Sender<bool>,
}

impl Pool {
    /// Build the pool, adopt any orphaned pool containers left over from a
    /// previous run, and start the maintenance ticker.
    pub async fn start(docker: Docker, mut config: PoolConfig) -> Self {
        if config.health_check_interval.is_zero() {
            config.health_check_interval = Duration::from_secs(2);
        }
        if config.max_burst == 0 {
            config.max_burst = 5;
        }
        if config.max_burst < config.min_idle {
            config.max_burst = config.min_idle;
        }

        let (stop, _) = watch::channel(false);
        let pool = Self {
            inner: Arc::new(PoolInner {
                docker,
                slots: Semaphore::new(config.max_burst),
                config,
                idle: Mutex::new(Vec::new()),
                managed_count: AtomicUsize::new(0),
                cooldown_until: StdMutex::new(None),
                stop,
            }),
        };

        pool.adopt_orphans().await;
        monitor::POOL_IDLE_COUNT.set(pool.inner.idle.lock().await.len() as f64);

        pool.spawn_worker();
        pool
    }

    /// Scan the runtime for containers labelled as pool-owned: adopt running
    /// ones, remove stopped ones.
    async fn adopt_orphans(&self) {
        let inner = &self.inner;
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("{LABEL_MANAGED_BY}={MANAGED_BY_VALUE}"),
                format!("{LABEL_PROJECT_ID}={POOL_PROJECT_ID}"),
            ],
        );
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = match inner.docker.list_containers(Some(options)).await {
            Ok(summaries) => summaries,
            Err(err) => {
                error!(%err, "failed to list orphaned containers");
                return;
            }
        };

        for summary in summaries {
            let id = summary.id.unwrap_or_default();
            if id.is_empty() {
                continue;
            }

            if summary.state.as_deref() != Some("running") {
                info!(container_id = %id, "removing stopped orphaned container");
                let options = bollard::container::RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                };
                if let Err(err) = inner.docker.remove_container(&id, Some(options)).await {
                    warn!(container_id = %id, %err, "failed to remove stopped orphan");
                }
                continue;
            }

            info!(container_id = %id, "adopting orphaned container");
            let inspect = match inner.docker.inspect_container(&id, None).await {
                Ok(inspect) => inspect,
                Err(err) => {
                    error!(container_id = %id, %err, "failed to inspect orphaned container");
                    continue;
                }
            };

            let labels = summary.labels.unwrap_or_default();
            let host_config = inspect.host_config.unwrap_or_default();
            let config = ContainerConfig {
                use_anonymous_vol: true,
                project_id: POOL_PROJECT_ID.to_string(),
                session_id: labels.get(LABEL_SESSION_ID).cloned().unwrap_or_default(),
                image: summary
                    .image
                    .unwrap_or_else(|| inner.config.warmup_image.clone()),
                env_vars: Vec::new(),
                memory_limit: host_config.memory.unwrap_or_default(),
                cpu_limit: host_config.nano_cpus.unwrap_or_default() as f64 / 1e9,
                network_name: inner.config.network_name.clone(),
                log_dir: inner.config.log_dir.clone(),
            };

            let ip = summary
                .network_settings
                .and_then(|ns| ns.networks)
                .and_then(|networks| {
                    networks
                        .get(&inner.config.network_name)
                        .and_then(|endpoint| endpoint.ip_address.clone())
                })
                .unwrap_or_default();

            let container = Container::attach(inner.docker.clone(), id, ip, config);

            inner.idle.lock().await.push(container);
            inner.managed_count.fetch_add(1, Ordering::SeqCst);
            monitor::POOL_MANAGED_COUNT.inc();
            match inner.slots.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => warn!("pool overflow during adoption"),
            }
        }
    }

    fn spawn_worker(&self) {
        let pool = self.clone();
        let mut stop_rx = self.inner.stop.subscribe();
        tokio::spawn(async move {
            let period = pool.inner.config.health_check_interval;
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => {
                        pool.health_check().await;
                        pool.maintain().await;
                    }
                }
            }
        });
    }

    /// Block until a capacity token is free, then hand out an idle container
    /// or burst-create a fresh one.
    pub async fn acquire(&self) -> Result<Container, PoolError> {
        let start = Instant::now();
        let mut token = self.take_token().await?;

        loop {
            let popped = { self.inner.idle.lock().await.pop() };

            let container = match popped {
                Some(container) => container,
                None => {
                    // Burst: our token now backs the container being created.
                    token.mark_managed();
                    return match self.create_warm_container().await {
                        Ok(container) => {
                            token.consume();
                            info!(container_id = %container.id, "created burst container");
                            monitor::POOL_ACQUISITION_LATENCY
                                .observe(start.elapsed().as_secs_f64());
                            Ok(container)
                        }
                        Err(err) => {
                            error!(%err, "failed to create burst container");
                            monitor::CONTAINER_CREATION_ERRORS.inc();
                            // Guard drop rolls back the count and the token.
                            Err(err.into())
                        }
                    };
                }
            };

            monitor::POOL_IDLE_COUNT.dec();
            if container.is_running().await {
                info!(container_id = %container.id, "acquired warm container");
                monitor::POOL_ACQUISITION_LATENCY.observe(start.elapsed().as_secs_f64());
                // The lease keeps the container's own reservation; our
                // surplus token goes back when the guard drops.
                return Ok(container);
            }

            warn!(container_id = %container.id, "pooled container is dead, discarding");
            let pool = self.clone();
            tokio::spawn(async move {
                pool.discard_managed(container).await;
            });
            // Try the next idle container (or burst) with the token we hold.
        }
    }

    /// Return a leased container. The caller gets its capacity back
    /// immediately; stop and removal happen in the background.
    ///
    /// Warm containers are never returned to the idle set: the agent has
    /// mutated the tmpfs workspace, and the replenisher restores `min_idle`
    /// with fresh instances.
    pub fn release(&self, container: Container) {
        self.inner.managed_count.fetch_sub(1, Ordering::SeqCst);
        monitor::POOL_MANAGED_COUNT.dec();
        self.return_token();

        tokio::spawn(async move {
            let cleanup = async {
                if let Err(err) = container.stop(2).await {
                    if !matches!(err, SandboxError::ContainerNotFound) {
                        error!(container_id = %container.id, %err, "failed to stop container");
                    }
                }
                if let Err(err) = container.remove().await {
                    if !matches!(err, SandboxError::ContainerNotFound) {
                        error!(container_id = %container.id, %err, "failed to remove container");
                    }
                }
                info!(container_id = %container.id, "released and removed container");
            };
            if tokio::time::timeout(RELEASE_CLEANUP_TIMEOUT, cleanup)
                .await
                .is_err()
            {
                warn!("release cleanup timed out");
            }
        });
    }

    /// Stop the maintenance worker, fail pending acquires, and tear down the
    /// idle set.
    pub async fn shutdown(&self) {
        let _ = self.inner.stop.send(true);
        self.inner.slots.close();

        let mut idle = self.inner.idle.lock().await;
        for container in idle.drain(..) {
            tokio::spawn(async move {
                let cleanup = async {
                    let _ = container.stop(10).await;
                    let _ = container.remove().await;
                };
                let _ = tokio::time::timeout(Duration::from_secs(15), cleanup).await;
            });
        }
        monitor::POOL_IDLE_COUNT.set(0.0);
    }

    /// Evict idle containers that are dead or whose agent no longer accepts
    /// connections; reclaim their capacity.
    async fn health_check(&self) {
        let mut idle = self.inner.idle.lock().await;
        let containers = std::mem::take(&mut *idle);
        let mut alive = Vec::with_capacity(containers.len());

        for container in containers {
            if container.is_running().await && self.agent_alive(&container.ip).await {
                alive.push(container);
            } else {
                warn!(container_id = %container.id, "removing dead container from pool");
                let pool = self.clone();
                tokio::spawn(async move {
                    pool.discard_managed(container).await;
                });
            }
        }

        monitor::POOL_IDLE_COUNT.set(alive.len() as f64);
        *idle = alive;
    }

    /// TCP probe against the in-container agent.
    async fn agent_alive(&self, ip: &str) -> bool {
        if self.inner.config.disable_health_check {
            return true;
        }
        if ip.is_empty() {
            return false;
        }
        let addr = format!("{ip}:{AGENT_PORT}");
        matches!(
            tokio::time::timeout(
                Duration::from_secs(1),
                tokio::net::TcpStream::connect(&addr)
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Top the idle set back up toward `min_idle`, bounded by `max_burst`
    /// and suppressed while the circuit breaker is open.
    async fn maintain(&self) {
        {
            let cooldown = self.inner.cooldown_until.lock().unwrap();
            if let Some(until) = *cooldown {
                if Instant::now() < until {
                    return;
                }
            }
        }

        let needed = {
            let idle = self.inner.idle.lock().await;
            replenish_quota(
                self.inner.config.min_idle,
                self.inner.config.max_burst,
                idle.len(),
                self.inner.managed_count.load(Ordering::SeqCst),
            )
        };
        if needed == 0 {
            return;
        }

        // Reserve capacity up front; each reservation is an
        // in-flight-creating container until it lands in the idle set or
        // rolls back.
        let mut reservations = Vec::new();
        for _ in 0..needed {
            match self.inner.slots.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    let mut token = SlotToken::new(self.clone());
                    token.mark_managed();
                    reservations.push(token);
                }
                Err(_) => break,
            }
        }
        if reservations.is_empty() {
            return;
        }

        let failures = Arc::new(AtomicU32::new(0));
        let limiter = Arc::new(Semaphore::new(REPLENISH_CONCURRENCY));
        let mut tasks = JoinSet::new();

        for token in reservations {
            let pool = self.clone();
            let failures = Arc::clone(&failures);
            let limiter = Arc::clone(&limiter);
            tasks.spawn(async move {
                let _permit = match limiter.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let created =
                    tokio::time::timeout(REPLENISH_CREATE_TIMEOUT, pool.create_warm_container())
                        .await;
                let container = match created {
                    Ok(Ok(container)) => container,
                    Ok(Err(err)) => {
                        pool.note_replenish_failure(&failures, &err.to_string());
                        drop(token);
                        return;
                    }
                    Err(_) => {
                        pool.note_replenish_failure(&failures, "creation timed out");
                        drop(token);
                        return;
                    }
                };

                let mut idle = pool.inner.idle.lock().await;
                let managed = pool.inner.managed_count.load(Ordering::SeqCst);
                if idle.len() < pool.inner.config.min_idle
                    && managed <= pool.inner.config.max_burst
                {
                    idle.push(container);
                    monitor::POOL_IDLE_COUNT.inc();
                    drop(idle);
                    // The reservation stays consumed while the container
                    // sits idle.
                    token.consume();
                } else {
                    drop(idle);
                    drop(token);
                    tokio::spawn(async move {
                        let _ = container.stop(10).await;
                        let _ = container.remove().await;
                    });
                }
            });
        }

        while tasks.join_next().await.is_some() {}
    }

    fn note_replenish_failure(&self, failures: &AtomicU32, err: &str) {
        error!(err, "failed to replenish pool");
        monitor::CONTAINER_CREATION_ERRORS.inc();
        if failures.fetch_add(1, Ordering::SeqCst) + 1 >= REPLENISH_FAILURE_LIMIT {
            let mut cooldown = self.inner.cooldown_until.lock().unwrap();
            *cooldown = Some(Instant::now() + REPLENISH_COOLDOWN);
            warn!(
                "replenish circuit open for {}s",
                REPLENISH_COOLDOWN.as_secs()
            );
        }
    }

    async fn create_warm_container(&self) -> Result<Container, SandboxError> {
        let inner = &self.inner;
        let session_id = format!(
            "warmup-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );

        let config = ContainerConfig {
            use_anonymous_vol: true,
            project_id: POOL_PROJECT_ID.to_string(),
            session_id,
            image: inner.config.warmup_image.clone(),
            env_vars: Vec::new(),
            memory_limit: inner.config.container_mem_mb * 1024 * 1024,
            cpu_limit: inner.config.container_cpu,
            network_name: inner.config.network_name.clone(),
            log_dir: inner.config.log_dir.clone(),
        };

        let mut container = Container::new(inner.docker.clone(), config, &inner.config.host_root);
        container.start().await?;
        Ok(container)
    }

    /// Create a per-session container with a host-bind workspace. Not pool
    /// managed; lifecycle belongs to the caller.
    pub async fn create_cold_container(
        &self,
        opts: ContainerOptions,
    ) -> Result<Container, SandboxError> {
        let inner = &self.inner;
        let config = ContainerConfig {
            use_anonymous_vol: false,
            project_id: opts.project_id,
            session_id: opts.session_id,
            image: opts.image,
            env_vars: opts.env_vars,
            memory_limit: inner.config.container_mem_mb * 1024 * 1024,
            cpu_limit: inner.config.container_cpu,
            network_name: inner.config.network_name.clone(),
            log_dir: inner.config.log_dir.clone(),
        };

        let mut container = Container::new(inner.docker.clone(), config, &inner.config.host_root);
        container.start().await?;
        Ok(container)
    }

    /// Remove a dead managed container and reclaim its reservation.
    async fn discard_managed(&self, container: Container) {
        if let Err(err) = container.remove().await {
            if !matches!(err, SandboxError::ContainerNotFound) {
                warn!(container_id = %container.id, %err, "failed to remove dead container");
            }
        }
        self.inner.managed_count.fetch_sub(1, Ordering::SeqCst);
        monitor::POOL_MANAGED_COUNT.dec();
        self.return_token();
    }

    async fn take_token(&self) -> Result<SlotToken, PoolError> {
        match self.inner.slots.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(SlotToken::new(self.clone()))
            }
            Err(_) => Err(PoolError::ShuttingDown),
        }
    }

    fn return_token(&self) {
        // The semaphore never holds more than max_burst tokens; a return
        // against a full pool means the accounting broke somewhere upstream.
        if self.inner.slots.available_permits() >= self.inner.config.max_burst {
            warn!("capacity token returned to a full pool, dropping it");
            return;
        }
        self.inner.slots.add_permits(1);
    }

    /// Snapshot of (idle, managed) for tests and introspection.
    pub async fn counts(&self) -> (usize, usize) {
        let idle = self.inner.idle.lock().await.len();
        (idle, self.inner.managed_count.load(Ordering::SeqCst))
    }

    /// Ids of the current idle containers, oldest first.
    pub async fn idle_ids(&self) -> Vec<String> {
        self.inner
            .idle
            .lock()
            .await
            .iter()
            .map(|c| c.id.clone())
            .collect()
    }
}

/// Consumed-capacity guard: until [`SlotToken::consume`] is called, dropping
/// it returns the token (and rolls back the managed count when the token was
/// marked as backing a container).
struct SlotToken {
    pool: Pool,
    managed: bool,
    armed: bool,
}

impl SlotToken {
    fn new(pool: Pool) -> Self {
        Self {
            pool,
            managed: false,
            armed: true,
        }
    }

    /// Record that this token now backs a managed container.
    fn mark_managed(&mut self) {
        self.pool.inner.managed_count.fetch_add(1, Ordering::SeqCst);
        monitor::POOL_MANAGED_COUNT.inc();
        self.managed = true;
    }

    /// Keep the token consumed; capacity stays attributed to its container.
    fn consume(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.managed {
            self.pool.inner.managed_count.fetch_sub(1, Ordering::SeqCst);
            monitor::POOL_MANAGED_COUNT.dec();
        }
        self.pool.return_token();
    }
}

/// How many containers replenishment should create right now.
fn replenish_quota(min_idle: usize, max_burst: usize, idle: usize, managed: usize) -> usize {
    let needed = min_idle.saturating_sub(idle);
    needed.min(max_burst.saturating_sub(managed))
}

//! Dependency wiring and process lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use bollard::Docker;
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::api::{create_router, AppState};
use crate::config::{listen_addr, Config};
use crate::dispatch::Dispatcher;
use crate::events::{EventBus, RedisBus};
use crate::monitor;
use crate::pool::{Pool, PoolConfig};
use crate::queue::{QueueWorker, TaskQueue};
use crate::service::PlatformService;
use crate::session::{
    cleanup_all_active, CleanerConfig, PgSessionRepository, SessionCleaner, SessionManager,
    SessionStore, SessionTaskWorker, SessionTerminator, WorkerConfig, SESSION_CREATE_TASK,
};

/// Shared infrastructure clients.
pub struct Dependencies {
    pub docker: Docker,
    pub redis_client: redis::Client,
    pub redis_conn: ConnectionManager,
    pub pg: PgPool,
}

impl Dependencies {
    /// Connect to the container runtime, redis, and postgres, failing fast
    /// when any of them is unreachable.
    pub async fn init(config: &Config) -> Result<Self> {
        let docker = Docker::connect_with_socket_defaults()
            .context("docker client")?
            .negotiate_version()
            .await
            .context("docker version negotiation")?;
        docker.ping().await.context("docker ping")?;

        let redis_client = redis::Client::open(config.redis.url()).context("redis client")?;
        let mut redis_conn = ConnectionManager::new(redis_client.clone())
            .await
            .with_context(|| format!("redis connection ({})", config.redis.addr))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut redis_conn)
            .await
            .with_context(|| format!("redis ping ({})", config.redis.addr))?;

        let pg = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.postgres.url())
            .await
            .with_context(|| format!("postgres connection ({})", config.postgres.addr))?;
        PgSessionRepository::migrate(&pg).await?;

        Ok(Self {
            docker,
            redis_client,
            redis_conn,
            pg,
        })
    }
}

/// Run the control plane until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let deps = Dependencies::init(&config).await?;

    let bus: Arc<dyn EventBus> = Arc::new(RedisBus::new(
        deps.redis_client.clone(),
        deps.redis_conn.clone(),
    ));

    let pool = Pool::start(
        deps.docker.clone(),
        PoolConfig {
            min_idle: config.pool.min_idle,
            max_burst: config.pool.max_burst,
            warmup_image: config.pool.warmup_image.clone(),
            health_check_interval: config.pool.health_check_interval,
            network_name: config.pool.network_name.clone(),
            host_root: config.pool.host_root.clone(),
            container_mem_mb: config.pool.container_mem_mb,
            container_cpu: config.pool.container_cpu,
            disable_health_check: false,
            log_dir: config.log.container_log_dir.clone(),
        },
    )
    .await;

    let repo: Arc<dyn SessionStore> = Arc::new(PgSessionRepository::new(
        deps.pg.clone(),
        Some(deps.redis_conn.clone()),
    ));
    let queue = TaskQueue::new(deps.redis_conn.clone());
    let manager = SessionManager::new(Arc::clone(&repo), queue);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&bus)));

    let service = Arc::new(PlatformService::new(
        manager,
        Arc::clone(&repo),
        dispatcher,
        Arc::clone(&bus),
        deps.docker.clone(),
        config.log.container_log_dir.clone(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);

    // Provisioning worker
    let task_worker = Arc::new(SessionTaskWorker::new(
        pool.clone(),
        Arc::clone(&repo),
        Arc::clone(&bus),
        WorkerConfig {
            project_dir: config.worker.project_dir.clone(),
        },
    ));
    let queue_worker = QueueWorker::new(
        deps.redis_client.clone(),
        SESSION_CREATE_TASK,
        config.worker.concurrency,
        task_worker,
    );
    let queue_stop = stop_rx.clone();
    let queue_task = tokio::spawn(async move { queue_worker.run(queue_stop).await });

    // Session cleaner
    let terminator: Arc<dyn SessionTerminator> = service.clone();
    let cleaner_task = if config.cleanup.enabled {
        let cleaner = SessionCleaner::new(
            Arc::clone(&repo),
            Arc::clone(&terminator),
            CleanerConfig {
                interval: config.cleanup.interval,
                max_age: config.cleanup.max_age,
            },
        );
        let cleaner_stop = stop_rx.clone();
        Some(tokio::spawn(async move { cleaner.run(cleaner_stop).await }))
    } else {
        None
    };

    // Metrics server
    let metrics_addr = listen_addr(&config.metrics.addr);
    let mut metrics_stop = stop_rx.clone();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = metrics_stop.changed().await;
        };
        if let Err(err) = monitor::serve_metrics(&metrics_addr, shutdown).await {
            error!(%err, "metrics server failed");
        }
    });

    // API server
    let router = create_router(
        AppState {
            service: Arc::clone(&service),
        },
        config.server.write_timeout,
    );
    let api_addr = listen_addr(&config.server.addr);
    let listener = TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("binding API server on {api_addr}"))?;
    info!(addr = %api_addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server")?;

    info!("shutdown signal received, draining");
    let _ = stop_tx.send(true);

    if config.cleanup.enabled {
        cleanup_all_active(&repo, &terminator).await;
    }

    if let Some(task) = cleaner_task {
        let _ = task.await;
    }
    let _ = queue_task.await;

    pool.shutdown().await;
    info!("server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

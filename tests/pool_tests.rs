//! Pool integration tests.
//!
//! These drive a real Docker daemon and are ignored by default:
//!
//! ```sh
//! cargo test --test pool_tests -- --ignored --test-threads=1
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;

use corral::pool::{Pool, PoolConfig};

const TEST_WARM_IMAGE: &str = "alpine:latest";

struct TestHarness {
    docker: Docker,
    network: String,
}

impl TestHarness {
    async fn new(network: &str) -> Self {
        let docker = Docker::connect_with_socket_defaults()
            .expect("docker client")
            .negotiate_version()
            .await
            .expect("docker negotiation");
        docker.ping().await.expect("docker daemon not available");

        let harness = Self {
            docker,
            network: network.to_string(),
        };
        harness.recreate_network().await;
        harness.ensure_image().await;
        harness
    }

    async fn ensure_image(&self) {
        use futures::StreamExt;
        if self.docker.inspect_image(TEST_WARM_IMAGE).await.is_ok() {
            return;
        }
        let options = bollard::image::CreateImageOptions {
            from_image: TEST_WARM_IMAGE.to_string(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(step) = pull.next().await {
            step.expect("image pull");
        }
    }

    async fn recreate_network(&self) {
        if let Ok(existing) = self.docker.inspect_network::<String>(&self.network, None).await {
            if let Some(containers) = existing.containers {
                for container_id in containers.keys() {
                    let _ = self
                        .docker
                        .remove_container(
                            container_id,
                            Some(RemoveContainerOptions {
                                force: true,
                                ..Default::default()
                            }),
                        )
                        .await;
                }
            }
            let _ = self.docker.remove_network(&self.network).await;
        }

        self.docker
            .create_network(CreateNetworkOptions {
                name: self.network.clone(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .expect("create test network");
    }

    fn pool_config(&self, min_idle: usize, max_burst: usize) -> PoolConfig {
        let tmp = std::env::temp_dir().join("corral-pool-tests");
        PoolConfig {
            min_idle,
            max_burst,
            warmup_image: TEST_WARM_IMAGE.to_string(),
            health_check_interval: Duration::from_secs(1),
            network_name: self.network.clone(),
            host_root: tmp.join("projects"),
            container_mem_mb: 64,
            container_cpu: 0.1,
            disable_health_check: true,
            log_dir: tmp.join("logs"),
        }
    }

    /// Create an externally-owned container carrying pool labels.
    async fn create_pool_labelled(&self, name: &str, session_id: &str, cmd: Vec<&str>) -> String {
        let labels = HashMap::from([
            ("managed_by".to_string(), "agent-platform".to_string()),
            ("project_id".to_string(), "pool".to_string()),
            ("session_id".to_string(), session_id.to_string()),
        ]);

        let config = Config {
            image: Some(TEST_WARM_IMAGE.to_string()),
            cmd: Some(cmd.into_iter().map(String::from).collect()),
            labels: Some(labels),
            host_config: Some(HostConfig {
                memory: Some(64 * 1024 * 1024),
                nano_cpus: Some(100_000_000),
                ..Default::default()
            }),
            networking_config: Some(bollard::container::NetworkingConfig {
                endpoints_config: HashMap::from([(
                    self.network.clone(),
                    EndpointSettings::default(),
                )]),
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .expect("create labelled container");
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .expect("start labelled container");
        created.id
    }

    async fn cleanup(&self, pool: Option<&Pool>) {
        if let Some(pool) = pool {
            pool.shutdown().await;
            // Let the deferred stop/remove tasks run.
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .unwrap_or_default();
        for summary in containers {
            let on_network = summary
                .network_settings
                .as_ref()
                .and_then(|ns| ns.networks.as_ref())
                .map(|networks| networks.contains_key(&self.network))
                .unwrap_or(false);
            if on_network {
                if let Some(id) = summary.id {
                    let _ = self
                        .docker
                        .remove_container(
                            &id,
                            Some(RemoveContainerOptions {
                                force: true,
                                ..Default::default()
                            }),
                        )
                        .await;
                }
            }
        }

        let _ = self.docker.remove_network(&self.network).await;
    }
}

/// Poll until `check` passes or the deadline expires.
async fn wait_for<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    false
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn pool_warms_up_to_min_idle() {
    let harness = TestHarness::new("corral-test-warmup-net").await;
    let pool = Pool::start(harness.docker.clone(), harness.pool_config(2, 5)).await;

    let warmed = wait_for(Duration::from_secs(30), || {
        let pool = pool.clone();
        async move { pool.counts().await.0 >= 2 }
    })
    .await;

    let (idle, managed) = pool.counts().await;
    harness.cleanup(Some(&pool)).await;

    assert!(warmed, "pool failed to warm up: idle={idle}");
    assert!(managed >= 2, "expected managed >= 2, got {managed}");
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn acquire_then_release_converges_to_min_idle() {
    let harness = TestHarness::new("corral-test-acquire-net").await;
    let pool = Pool::start(harness.docker.clone(), harness.pool_config(1, 2)).await;

    assert!(
        wait_for(Duration::from_secs(30), || {
            let pool = pool.clone();
            async move { pool.counts().await.0 >= 1 }
        })
        .await,
        "pool did not warm up"
    );

    let container = pool.acquire().await.expect("acquire");
    let (idle, managed) = pool.counts().await;
    assert_eq!(idle, 0, "expected no idle containers after acquire");
    assert_eq!(managed, 1, "expected one managed container");
    assert!(container.is_running().await, "acquired container not running");

    let container_id = container.id.clone();
    pool.release(container);

    // Release destroys the lease; the replenisher restores min_idle.
    assert!(
        wait_for(Duration::from_secs(30), || {
            let pool = pool.clone();
            async move {
                let (idle, managed) = pool.counts().await;
                idle == 1 && managed == 1
            }
        })
        .await,
        "pool did not converge back to min_idle"
    );

    // The released container must be gone from the runtime.
    let removed = wait_for(Duration::from_secs(15), || {
        let docker = harness.docker.clone();
        let id = container_id.clone();
        async move { docker.inspect_container(&id, None).await.is_err() }
    })
    .await;

    harness.cleanup(Some(&pool)).await;
    assert!(removed, "released container still present in runtime");
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn saturated_pool_serves_all_acquirers() {
    let harness = TestHarness::new("corral-test-concurrency-net").await;
    let pool = Pool::start(harness.docker.clone(), harness.pool_config(2, 5)).await;

    assert!(
        wait_for(Duration::from_secs(30), || {
            let pool = pool.clone();
            async move { pool.counts().await.0 >= 2 }
        })
        .await,
        "pool did not warm up"
    );

    // Sample managed_count while the burst runs; it must never exceed
    // max_burst.
    let max_observed = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let pool = pool.clone();
        let max_observed = Arc::clone(&max_observed);
        tokio::spawn(async move {
            loop {
                let (_, managed) = pool.counts().await;
                max_observed.fetch_max(managed, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let container =
                tokio::time::timeout(Duration::from_secs(20), pool.acquire()).await??;
            tokio::time::sleep(Duration::from_secs(2)).await;
            pool.release(container);
            Ok::<_, anyhow::Error>(())
        }));
    }

    let mut successes = 0;
    for task in tasks {
        if task.await.map(|r| r.is_ok()).unwrap_or(false) {
            successes += 1;
        }
    }
    sampler.abort();

    let peak = max_observed.load(Ordering::SeqCst);
    harness.cleanup(Some(&pool)).await;

    assert_eq!(successes, 10, "expected all acquirers to succeed");
    assert!(peak <= 5, "managed count exceeded max_burst: {peak}");
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn health_check_replaces_stopped_container() {
    let harness = TestHarness::new("corral-test-health-net").await;
    let mut config = harness.pool_config(2, 5);
    config.health_check_interval = Duration::from_secs(2);
    let pool = Pool::start(harness.docker.clone(), config).await;

    assert!(
        wait_for(Duration::from_secs(30), || {
            let pool = pool.clone();
            async move { pool.counts().await.0 >= 2 }
        })
        .await,
        "pool did not warm up"
    );

    let victim = pool.idle_ids().await.first().cloned().expect("idle victim");
    harness
        .docker
        .stop_container(&victim, Some(StopContainerOptions { t: 0 }))
        .await
        .expect("stop victim");

    let replaced = wait_for(Duration::from_secs(20), || {
        let pool = pool.clone();
        let victim = victim.clone();
        async move {
            let ids = pool.idle_ids().await;
            !ids.contains(&victim) && ids.len() >= 2
        }
    })
    .await;

    harness.cleanup(Some(&pool)).await;
    assert!(replaced, "victim not replaced after health check");
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn running_orphans_are_adopted() {
    let harness = TestHarness::new("corral-test-orphan-net").await;

    let orphan_id = harness
        .create_pool_labelled("corral-orphan-test", "orphan-session", vec!["top"])
        .await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let pool = Pool::start(harness.docker.clone(), harness.pool_config(2, 5)).await;

    let adopted = wait_for(Duration::from_secs(15), || {
        let pool = pool.clone();
        let orphan_id = orphan_id.clone();
        async move {
            let (idle, managed) = pool.counts().await;
            pool.idle_ids().await.contains(&orphan_id) && idle >= 2 && managed >= 2
        }
    })
    .await;

    harness.cleanup(Some(&pool)).await;
    assert!(adopted, "orphan was not adopted into the idle set");
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn agent_probe_evicts_containers_without_listener() {
    let harness = TestHarness::new("corral-test-probe-net").await;

    // One orphan listens on the agent port, the other just idles.
    let healthy_id = harness
        .create_pool_labelled(
            "corral-probe-healthy",
            "healthy-session",
            vec!["sh", "-c", "while true; do nc -l -p 50051 -e echo ok; done"],
        )
        .await;
    let unhealthy_id = harness
        .create_pool_labelled("corral-probe-unhealthy", "unhealthy-session", vec!["top"])
        .await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut config = harness.pool_config(2, 5);
    config.health_check_interval = Duration::from_secs(2);
    config.disable_health_check = false;
    let pool = Pool::start(harness.docker.clone(), config).await;

    let settled = wait_for(Duration::from_secs(20), || {
        let pool = pool.clone();
        let healthy_id = healthy_id.clone();
        let unhealthy_id = unhealthy_id.clone();
        async move {
            let ids = pool.idle_ids().await;
            ids.contains(&healthy_id) && !ids.contains(&unhealthy_id)
        }
    })
    .await;

    harness.cleanup(Some(&pool)).await;
    assert!(
        settled,
        "agent probe did not keep the listener and evict the idler"
    );
}

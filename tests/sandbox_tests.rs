//! Container abstraction integration tests.
//!
//! Ignored by default; they need a Docker daemon:
//!
//! ```sh
//! cargo test --test sandbox_tests -- --ignored --test-threads=1
//! ```

use std::collections::HashMap;
use std::time::Duration;

use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use tempfile::TempDir;

use corral::sandbox::{Container, ContainerConfig, SandboxError};
use corral::session::{generate_env_file, tar_directory};

const TEST_IMAGE: &str = "alpine:latest";
const TEST_NETWORK: &str = "corral-test-sandbox-net";

struct Fixture {
    docker: Docker,
    _dirs: TempDir,
    host_root: std::path::PathBuf,
    log_dir: std::path::PathBuf,
}

impl Fixture {
    async fn new() -> Self {
        let docker = Docker::connect_with_socket_defaults()
            .expect("docker client")
            .negotiate_version()
            .await
            .expect("docker negotiation");
        docker.ping().await.expect("docker daemon not available");

        if docker
            .inspect_network::<String>(TEST_NETWORK, None)
            .await
            .is_err()
        {
            docker
                .create_network(CreateNetworkOptions {
                    name: TEST_NETWORK.to_string(),
                    driver: "bridge".to_string(),
                    ..Default::default()
                })
                .await
                .expect("create network");
        }

        let dirs = TempDir::new().expect("tempdir");
        let host_root = dirs.path().join("projects");
        let log_dir = dirs.path().join("logs");
        std::fs::create_dir_all(&host_root).unwrap();
        std::fs::create_dir_all(&log_dir).unwrap();

        Self {
            docker,
            host_root,
            log_dir,
            _dirs: dirs,
        }
    }

    fn config(&self, session_id: &str, anonymous: bool) -> ContainerConfig {
        ContainerConfig {
            use_anonymous_vol: anonymous,
            project_id: "test-project".to_string(),
            session_id: session_id.to_string(),
            image: TEST_IMAGE.to_string(),
            env_vars: vec!["TEST_MARKER=1".to_string()],
            memory_limit: 64 * 1024 * 1024,
            cpu_limit: 0.2,
            network_name: TEST_NETWORK.to_string(),
            log_dir: self.log_dir.clone(),
        }
    }
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn cold_container_lifecycle_and_exec() {
    let fixture = Fixture::new().await;
    let mut container = Container::new(
        fixture.docker.clone(),
        fixture.config("sandbox-lifecycle", false),
        &fixture.host_root,
    );

    container.start().await.expect("start");
    assert!(!container.id.is_empty(), "container id not captured");
    assert!(!container.ip.is_empty(), "container ip not captured");
    assert!(container.is_running().await);

    // The bind-mounted workspace must exist on the host.
    let workspace = fixture.host_root.join("test-project");
    assert!(workspace.is_dir(), "host workspace not created");

    let result = container
        .exec(
            vec!["sh".to_string(), "-c".to_string(), "echo hello".to_string()],
            Vec::new(),
            None,
        )
        .await
        .expect("exec");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.trim(), "hello");

    // Exec outcomes land in the per-session JSONL log.
    let entries = container.exec_logs().await.expect("exec logs");
    assert!(!entries.is_empty());
    assert_eq!(entries.last().unwrap().exit_code, 0);
    assert!(entries.last().unwrap().output.contains("hello"));

    // Non-zero exits are reported, not errors.
    let failed = container
        .exec(
            vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            Vec::new(),
            None,
        )
        .await
        .expect("exec with failure");
    assert_eq!(failed.exit_code, 3);

    container.stop(2).await.expect("stop");
    container.remove().await.expect("remove");
    assert!(matches!(
        container.stop(1).await,
        Err(SandboxError::ContainerNotFound)
    ));
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn file_transfer_round_trip() {
    let fixture = Fixture::new().await;
    let mut container = Container::new(
        fixture.docker.clone(),
        fixture.config("sandbox-files", true),
        &fixture.host_root,
    );
    container.start().await.expect("start");

    // Single-file copy into the workspace.
    let env_file = generate_env_file(&["API_KEY=test-key".to_string()]);
    container
        .copy_to_container(".env", &env_file)
        .await
        .expect("copy .env");

    let result = container
        .exec(
            vec!["cat".to_string(), "/app/workspace/.env".to_string()],
            Vec::new(),
            None,
        )
        .await
        .expect("cat .env");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "API_KEY=test-key\n");

    // Multi-file archive upload preserves the tree.
    let project = TempDir::new().unwrap();
    std::fs::create_dir_all(project.path().join("src")).unwrap();
    std::fs::write(project.path().join("src/app.py"), b"print('ok')\n").unwrap();
    std::fs::write(project.path().join("README.md"), b"# demo\n").unwrap();
    let archive = tar_directory(project.path()).expect("tar project");

    container.upload_archive("/", archive).await.expect("upload");
    let listing = container
        .exec(
            vec![
                "ls".to_string(),
                "/app/workspace/src".to_string(),
                "/app/workspace".to_string(),
            ],
            Vec::new(),
            None,
        )
        .await
        .expect("ls");
    assert!(listing.stdout.contains("app.py"));
    assert!(listing.stdout.contains("README.md"));

    // Read a single file back out through the tar export.
    let mut round_trip = Vec::new();
    container
        .copy_from_container("src/app.py", &mut round_trip)
        .await
        .expect("copy out");
    assert_eq!(round_trip, b"print('ok')\n");

    container.remove().await.expect("remove");
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn exec_demultiplexes_stdout_and_stderr() {
    let fixture = Fixture::new().await;
    let mut container = Container::new(
        fixture.docker.clone(),
        fixture.config("sandbox-streams", true),
        &fixture.host_root,
    );
    container.start().await.expect("start");

    let result = container
        .exec(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo to-stdout; echo to-stderr 1>&2".to_string(),
            ],
            Vec::new(),
            None,
        )
        .await
        .expect("exec");
    assert_eq!(result.stdout.trim(), "to-stdout");
    assert_eq!(result.stderr.trim(), "to-stderr");

    // The silent keep-alive entrypoint produces no container logs.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let logs = container.get_logs(Some(50)).await.expect("logs");
    assert!(logs.stdout.is_empty());
    assert!(logs.stderr.is_empty());

    container.stop(1).await.expect("stop");
    assert!(!container.is_running().await);

    container.remove().await.expect("remove");
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn host_mirror_file_operations() {
    let fixture = Fixture::new().await;
    let mut container = Container::new(
        fixture.docker.clone(),
        fixture.config("sandbox-mirror", false),
        &fixture.host_root,
    );
    container.start().await.expect("start");

    container
        .write_file("notes.txt", b"from the host side\n", 0o644)
        .await
        .expect("write file");

    // Visible inside the container through the bind mount.
    let result = container
        .exec(
            vec!["cat".to_string(), "/app/workspace/notes.txt".to_string()],
            Vec::new(),
            None,
        )
        .await
        .expect("cat");
    assert_eq!(result.stdout, "from the host side\n");

    // And readable back through the mirror.
    use tokio::io::AsyncReadExt;
    let mut file = container.open_file("notes.txt").await.expect("open file");
    let mut contents = String::new();
    file.read_to_string(&mut contents).await.expect("read");
    assert_eq!(contents, "from the host side\n");

    let listing = container.list_files("").await.expect("list files");
    assert!(listing.iter().any(|f| f.path == "notes.txt" && !f.is_dir));

    // Escapes are rejected on every mirror operation.
    assert!(matches!(
        container.open_file("../outside").await,
        Err(SandboxError::InvalidPath(_))
    ));
    assert!(matches!(
        container.write_file("../../etc/oops", b"x", 0o644).await,
        Err(SandboxError::InvalidPath(_))
    ));

    container.remove().await.expect("remove");
}

#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn start_failure_cleans_up_partial_container() {
    let fixture = Fixture::new().await;
    let mut config = fixture.config("sandbox-badimage", true);
    config.image = "corral-test/does-not-exist:latest".to_string();
    let mut container = Container::new(fixture.docker.clone(), config, &fixture.host_root);

    let err = container.start().await.expect_err("start should fail");
    assert!(matches!(err, SandboxError::ImagePullFailed(_)));

    // No half-created container may remain.
    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        vec!["session_id=sandbox-badimage".to_string()],
    );
    let leftovers = fixture
        .docker
        .list_containers(Some(bollard::container::ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
        .expect("list");
    assert!(leftovers.is_empty(), "partial container left behind");
}

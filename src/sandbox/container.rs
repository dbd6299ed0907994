//! Container lifecycle and file transfer over the Docker Engine API.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::Docker;
use chrono::Utc;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::error::{is_not_found, SandboxError, SandboxResult};
use super::types::{
    container_name, default_host_path, ContainerConfig, ExecLogEntry, ExecResult, FileInfo,
    LogResult, LABEL_MANAGED_BY, LABEL_PROJECT_ID, LABEL_SESSION_ID, MANAGED_BY_VALUE, MOUNT_PATH,
};

/// Size cap for the tmpfs workspace of warm containers.
const TMPFS_OPTS: &str = "rw,size=512m";

/// In-process handle to one sandbox container.
#[derive(Clone)]
pub struct Container {
    pub id: String,
    /// Address on the shared network, captured after start.
    pub ip: String,
    pub config: ContainerConfig,
    /// Host side of the workspace bind mount; `None` for anonymous workspaces.
    pub host_path: Option<PathBuf>,
    pub mount_path: String,
    docker: Docker,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("session_id", &self.config.session_id)
            .finish()
    }
}

impl Container {
    /// Create a handle for a container that does not exist yet.
    pub fn new(docker: Docker, config: ContainerConfig, host_root: &Path) -> Self {
        let host_path = if config.use_anonymous_vol {
            None
        } else {
            Some(default_host_path(host_root, &config.project_id))
        };

        let log_path = config.log_dir.join(&config.session_id);
        if let Err(err) = std::fs::create_dir_all(&log_path) {
            error!(session_id = %config.session_id, %err, "failed to create exec log directory");
        }

        Self {
            id: String::new(),
            ip: String::new(),
            config,
            host_path,
            mount_path: MOUNT_PATH.to_string(),
            docker,
        }
    }

    /// Rebuild a handle for an already-running container (orphan adoption,
    /// dispatch against a persisted session row).
    pub fn attach(docker: Docker, id: String, ip: String, config: ContainerConfig) -> Self {
        Self {
            id,
            ip,
            config,
            host_path: None,
            mount_path: MOUNT_PATH.to_string(),
            docker,
        }
    }

    /// Ensure the image exists, create the container with its workspace and
    /// labels, attach it to the shared network, start it, and capture its ip.
    ///
    /// Any failure after create force-removes the partial container.
    pub async fn start(&mut self) -> SandboxResult<()> {
        info!(image = %self.config.image, session_id = %self.config.session_id, "starting container");

        self.ensure_image().await?;

        if let Some(host_path) = &self.host_path {
            tokio::fs::create_dir_all(host_path).await?;
        }

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(LABEL_PROJECT_ID.to_string(), self.config.project_id.clone());
        labels.insert(LABEL_SESSION_ID.to_string(), self.config.session_id.clone());

        let host_config = match (&self.host_path, self.config.use_anonymous_vol) {
            (_, true) => HostConfig {
                memory: Some(self.config.memory_limit),
                nano_cpus: Some((self.config.cpu_limit * 1e9) as i64),
                auto_remove: Some(false),
                tmpfs: Some(HashMap::from([(
                    self.mount_path.clone(),
                    TMPFS_OPTS.to_string(),
                )])),
                ..Default::default()
            },
            (Some(host_path), false) => HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:rw",
                    host_path.display(),
                    self.mount_path
                )]),
                memory: Some(self.config.memory_limit),
                nano_cpus: Some((self.config.cpu_limit * 1e9) as i64),
                auto_remove: Some(false),
                ..Default::default()
            },
            (None, false) => {
                return Err(SandboxError::ContainerStartFailed(
                    "host-bind workspace requested but no host path resolved".to_string(),
                ));
            }
        };

        let container_config = Config {
            image: Some(self.config.image.clone()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            env: Some(self.config.env_vars.clone()),
            working_dir: Some(self.mount_path.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    self.config.network_name.clone(),
                    EndpointSettings::default(),
                )]),
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name(&self.config.session_id),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|err| SandboxError::ContainerStartFailed(err.to_string()))?;
        self.id = created.id;

        if let Err(err) = self
            .docker
            .start_container(&self.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.force_remove_partial().await;
            return Err(SandboxError::ContainerStartFailed(err.to_string()));
        }

        let inspect = match self.docker.inspect_container(&self.id, None).await {
            Ok(inspect) => inspect,
            Err(err) => {
                self.force_remove_partial().await;
                return Err(err.into());
            }
        };

        if let Some(networks) = inspect.network_settings.and_then(|ns| ns.networks) {
            if let Some(endpoint) = networks.get(&self.config.network_name) {
                self.ip = endpoint.ip_address.clone().unwrap_or_default();
            } else if let Some(endpoint) = networks.values().next() {
                self.ip = endpoint.ip_address.clone().unwrap_or_default();
            }
        }

        info!(container_id = %self.id, ip = %self.ip, "container started");
        Ok(())
    }

    async fn ensure_image(&self) -> SandboxResult<()> {
        match self.docker.inspect_image(&self.config.image).await {
            Ok(_) => return Ok(()),
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }

        info!(image = %self.config.image, "image not found, pulling");
        let options = CreateImageOptions {
            from_image: self.config.image.clone(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|err| SandboxError::ImagePullFailed(err.to_string()))?;
        }
        info!(image = %self.config.image, "image pull completed");
        Ok(())
    }

    async fn force_remove_partial(&self) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(err) = self.docker.remove_container(&self.id, Some(options)).await {
            if !is_not_found(&err) {
                warn!(container_id = %self.id, %err, "failed to remove partial container");
            }
        }
    }

    /// Graceful stop with the given timeout in seconds.
    pub async fn stop(&self, timeout_seconds: i64) -> SandboxResult<()> {
        let options = StopContainerOptions { t: timeout_seconds };
        match self.docker.stop_container(&self.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Err(SandboxError::ContainerNotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Force remove.
    pub async fn remove(&self) -> SandboxResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&self.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Err(SandboxError::ContainerNotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Run a command inside the container with demultiplexed output and append
    /// the outcome to the session's exec log.
    pub async fn exec(
        &self,
        cmd: Vec<String>,
        env: Vec<String>,
        work_dir: Option<&str>,
    ) -> SandboxResult<ExecResult> {
        let work_dir = work_dir.unwrap_or(&self.mount_path).to_string();

        let options = CreateExecOptions {
            cmd: Some(cmd.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: Some(work_dir),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&self.id, options)
            .await
            .map_err(|err| SandboxError::ExecFailed(format!("failed to create exec: {err}")))?;

        let start = Instant::now();
        let mut stdout = String::new();
        let mut stderr = String::new();

        let attached = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|err| SandboxError::ExecFailed(format!("failed to attach to exec: {err}")))?;

        if let StartExecResults::Attached { mut output, .. } = attached {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        return Err(SandboxError::ExecFailed(format!("exec stream: {err}")));
                    }
                }
            }
        }

        let duration = start.elapsed();

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|err| SandboxError::ExecFailed(format!("failed to inspect exec: {err}")))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        let result = ExecResult {
            exit_code,
            stdout,
            stderr,
            duration,
        };
        self.append_exec_log(&cmd, &result).await;

        Ok(result)
    }

    async fn append_exec_log(&self, cmd: &[String], result: &ExecResult) {
        let entry = ExecLogEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            command: cmd.to_vec(),
            output: result.combined(),
            exit_code: result.exit_code,
            duration_ms: result.duration.as_millis() as i64,
        };

        let log_file = self.exec_log_path();
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                error!(%err, "failed to marshal exec log entry");
                return;
            }
        };

        let open = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_file)
            .await;
        match open {
            Ok(mut file) => {
                if let Err(err) = file.write_all(format!("{line}\n").as_bytes()).await {
                    error!(%err, "failed to append exec log entry");
                }
            }
            Err(err) => error!(%err, path = %log_file.display(), "failed to open exec log"),
        }
    }

    fn exec_log_path(&self) -> PathBuf {
        self.config
            .log_dir
            .join(&self.config.session_id)
            .join("events.jsonl")
    }

    /// Read back this session's exec log entries.
    pub async fn exec_logs(&self) -> SandboxResult<Vec<ExecLogEntry>> {
        let contents = match tokio::fs::read_to_string(self.exec_log_path()).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        for line in contents.lines() {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(%err, "skipping malformed exec log entry"),
            }
        }
        Ok(entries)
    }

    /// Write a file through the host-side workspace mirror.
    pub async fn write_file(&self, path: &str, contents: &[u8], mode: u32) -> SandboxResult<()> {
        let target = self.resolve_host_path(path)?;
        tokio::fs::write(&target, contents).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode)).await?;
        }
        Ok(())
    }

    /// Open a file through the host-side workspace mirror.
    pub async fn open_file(&self, path: &str) -> SandboxResult<tokio::fs::File> {
        let target = self.resolve_host_path(path)?;
        Ok(tokio::fs::File::open(&target).await?)
    }

    /// List a workspace directory through the host mirror.
    pub async fn list_files(&self, path: &str) -> SandboxResult<Vec<FileInfo>> {
        let target = self.resolve_host_path(path)?;
        let mut dir = tokio::fs::read_dir(&target).await?;

        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            files.push(FileInfo {
                path: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                is_dir: meta.is_dir(),
                mod_time: meta.modified().ok().map(Into::into),
            });
        }
        Ok(files)
    }

    /// Demultiplexed container logs, optionally limited to the last `tail`
    /// lines.
    pub async fn get_logs(&self, tail: Option<usize>) -> SandboxResult<LogResult> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.logs(&self.id, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdOut { message } => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdErr { message } => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }
        Ok(LogResult { stdout, stderr })
    }

    /// Copy a single file into the container workspace via a synthesised tar
    /// stream.
    pub async fn copy_to_container(&self, dest_path: &str, contents: &[u8]) -> SandboxResult<()> {
        let target = self.resolve_container_path(dest_path)?;
        let (parent, base) = split_container_path(&target);

        self.exec(
            vec!["mkdir".to_string(), "-p".to_string(), parent.clone()],
            Vec::new(),
            Some("/"),
        )
        .await?;

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, base, contents)
            .map_err(SandboxError::Io)?;
        let archive = builder.into_inner().map_err(SandboxError::Io)?;

        let options = UploadToContainerOptions {
            path: parent,
            ..Default::default()
        };
        self.docker
            .upload_to_container(&self.id, Some(options), archive.into())
            .await?;
        Ok(())
    }

    /// Upload a caller-supplied tar archive, preserving its directory
    /// structure under `dest_path`.
    pub async fn upload_archive(&self, dest_path: &str, archive: Vec<u8>) -> SandboxResult<()> {
        let target = self.resolve_container_path(dest_path)?;

        self.exec(
            vec!["mkdir".to_string(), "-p".to_string(), target.clone()],
            Vec::new(),
            Some("/"),
        )
        .await?;

        let options = UploadToContainerOptions {
            path: target,
            ..Default::default()
        };
        self.docker
            .upload_to_container(&self.id, Some(options), archive.into())
            .await?;
        Ok(())
    }

    /// Stream a path out of the container, writing the contents of each
    /// regular file entry sequentially into `dest`.
    pub async fn copy_from_container<W: Write>(
        &self,
        src_path: &str,
        dest: &mut W,
    ) -> SandboxResult<()> {
        let target = self.resolve_container_path(src_path)?;

        let options = DownloadFromContainerOptions { path: target };
        let mut stream = self.docker.download_from_container(&self.id, Some(options));

        let mut raw = Vec::new();
        while let Some(chunk) = stream.next().await {
            raw.extend_from_slice(&chunk?);
        }

        let mut archive = tar::Archive::new(raw.as_slice());
        for entry in archive.entries().map_err(SandboxError::Io)? {
            let mut entry = entry.map_err(SandboxError::Io)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            std::io::copy(&mut entry, dest).map_err(SandboxError::Io)?;
        }
        Ok(())
    }

    /// True iff the runtime reports the container as running.
    pub async fn is_running(&self) -> bool {
        match self.docker.inspect_container(&self.id, None).await {
            Ok(inspect) => inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Last observed runtime status string.
    pub async fn status(&self) -> SandboxResult<String> {
        let inspect = match self.docker.inspect_container(&self.id, None).await {
            Ok(inspect) => inspect,
            Err(err) if is_not_found(&err) => return Err(SandboxError::ContainerNotFound),
            Err(err) => return Err(err.into()),
        };
        Ok(inspect
            .state
            .and_then(|state| state.status)
            .map(|status| status.to_string())
            .unwrap_or_default())
    }

    fn resolve_host_path(&self, user_path: &str) -> SandboxResult<PathBuf> {
        let base = self.host_path.as_ref().ok_or_else(|| {
            SandboxError::InvalidPath("session has no host-bound workspace".to_string())
        })?;
        resolve_workspace_path(base, user_path)
    }

    fn resolve_container_path(&self, user_path: &str) -> SandboxResult<String> {
        resolve_container_target(&self.mount_path, user_path)
    }
}

/// Resolve a user path beneath a host workspace root, rejecting escapes.
fn resolve_workspace_path(base: &Path, user_path: &str) -> SandboxResult<PathBuf> {
    let relative = user_path.trim_start_matches('/');
    let mut resolved = base.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() || !resolved.starts_with(base) {
                    return Err(SandboxError::InvalidPath(format!(
                        "path escapes workspace: {user_path}"
                    )));
                }
            }
            _ => {
                return Err(SandboxError::InvalidPath(format!(
                    "path escapes workspace: {user_path}"
                )));
            }
        }
    }
    if !resolved.starts_with(base) {
        return Err(SandboxError::InvalidPath(format!(
            "path escapes workspace: {user_path}"
        )));
    }
    Ok(resolved)
}

/// Resolve a user path beneath the in-container mount root using
/// forward-slash semantics regardless of host separator.
fn resolve_container_target(base: &str, user_path: &str) -> SandboxResult<String> {
    let base_parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    let mut parts = base_parts.clone();

    for segment in user_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.len() <= base_parts.len() {
                    return Err(SandboxError::InvalidPath(format!(
                        "path escapes workspace: {user_path}"
                    )));
                }
                parts.pop();
            }
            part => parts.push(part),
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Split an absolute container path into its parent directory and base name.
fn split_container_path(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_target_stays_inside_mount() {
        assert_eq!(
            resolve_container_target(MOUNT_PATH, "src/main.py").unwrap(),
            "/app/workspace/src/main.py"
        );
        assert_eq!(
            resolve_container_target(MOUNT_PATH, "/").unwrap(),
            "/app/workspace"
        );
        assert_eq!(
            resolve_container_target(MOUNT_PATH, "a/./b").unwrap(),
            "/app/workspace/a/b"
        );
        assert_eq!(
            resolve_container_target(MOUNT_PATH, "a/../b").unwrap(),
            "/app/workspace/b"
        );
    }

    #[test]
    fn container_target_rejects_escapes() {
        assert!(resolve_container_target(MOUNT_PATH, "../etc/passwd").is_err());
        assert!(resolve_container_target(MOUNT_PATH, "a/../../etc").is_err());
        assert!(resolve_container_target(MOUNT_PATH, "../../..").is_err());
    }

    #[test]
    fn workspace_path_stays_inside_root() {
        let base = Path::new("/srv/projects/demo");
        assert_eq!(
            resolve_workspace_path(base, "notes/todo.txt").unwrap(),
            PathBuf::from("/srv/projects/demo/notes/todo.txt")
        );
        // Absolute user paths are treated as workspace-relative.
        assert_eq!(
            resolve_workspace_path(base, "/etc/passwd").unwrap(),
            PathBuf::from("/srv/projects/demo/etc/passwd")
        );
    }

    #[test]
    fn workspace_path_rejects_traversal() {
        let base = Path::new("/srv/projects/demo");
        assert!(resolve_workspace_path(base, "../other").is_err());
        assert!(resolve_workspace_path(base, "a/../../../etc").is_err());
    }

    #[test]
    fn split_parent_and_base() {
        assert_eq!(
            split_container_path("/app/workspace/.env"),
            ("/app/workspace".to_string(), ".env".to_string())
        );
        assert_eq!(
            split_container_path("/file"),
            ("/".to_string(), "file".to_string())
        );
    }
}

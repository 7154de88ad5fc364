//! Docker CLI executor
//!
//! Deployments run as detached containers pinned to one GPU with
//! `--gpus device=<id>`. Containers are labelled with their deployment id so
//! `container.list` only reports what this worker started.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::executor::{
    check_placement, merge_update, CommandExecutor, DeploymentContainer, ExecutorError,
    ModelInfo, ProgressSink,
};
use crate::config::DockerConfig;
use crate::protocol::{
    ContainerRuntime, DeploymentCreatePayload, DeploymentStopPayload, DeploymentUpdatePayload,
    GpuDevice, LogEntry, LogLevel, LogSource, ModelDownloadPayload, ModelDownloadProgressPayload,
    ModelRefPayload, ModelSource,
};

/// Label carrying the deployment id on every container we start
pub const DEPLOYMENT_LABEL: &str = "nodelink.deployment";

/// Grace added on top of `docker stop -t` before we give up waiting
const STOP_GRACE: Duration = Duration::from_secs(15);

/// Percent step between two progress events
const PROGRESS_STEP: u8 = 5;

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Generate `docker run` arguments for a deployment
pub fn generate_run_args(
    config: &DockerConfig,
    deployment_id: &str,
    spec: &DeploymentCreatePayload,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.container_name.clone(),
        "--label".to_string(),
        format!("{}={}", DEPLOYMENT_LABEL, deployment_id),
        "--gpus".to_string(),
        format!("device={}", spec.gpu_device_id),
        "-p".to_string(),
        format!("{}:{}", spec.container_port, spec.container_port),
    ];

    if let Some(network) = &config.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }

    // Model weights are mounted read-only at the same path
    args.push("-v".to_string());
    args.push(format!("{}:{}:ro", spec.model_path, spec.model_path));

    args.push("-e".to_string());
    args.push(format!("MODEL_ID={}", spec.model_id));
    args.push("-e".to_string());
    args.push(format!("MODEL_PATH={}", spec.model_path));
    args.push("-e".to_string());
    args.push(format!("PORT={}", spec.container_port));

    if let Some(limit) = spec.gpu_memory_limit {
        args.push("-e".to_string());
        args.push(format!("GPU_MEMORY_LIMIT_MB={}", limit));
    }

    // Sorted so the command line is stable
    let mut env: Vec<_> = spec.environment.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.extend(config.extra_args.iter().cloned());
    args.push(spec.container_image.clone());
    args
}

pub fn generate_stop_args(container_name: &str, timeout_secs: u64) -> Vec<String> {
    vec![
        "stop".to_string(),
        "-t".to_string(),
        timeout_secs.to_string(),
        container_name.to_string(),
    ]
}

pub fn generate_kill_args(container_name: &str) -> Vec<String> {
    vec!["kill".to_string(), container_name.to_string()]
}

pub fn generate_restart_args(container_name: &str) -> Vec<String> {
    vec!["restart".to_string(), container_name.to_string()]
}

pub fn generate_rm_args(container_name: &str, force: bool) -> Vec<String> {
    let mut args = vec!["rm".to_string()];
    if force {
        args.push("-f".to_string());
    }
    args.push(container_name.to_string());
    args
}

pub fn generate_logs_args(container: &str, tail: Option<u32>) -> Vec<String> {
    let mut args = vec!["logs".to_string(), "--timestamps".to_string()];
    if let Some(tail) = tail {
        args.push("--tail".to_string());
        args.push(tail.to_string());
    }
    args.push(container.to_string());
    args
}

pub fn generate_ps_args() -> Vec<String> {
    vec![
        "ps".to_string(),
        "-a".to_string(),
        "--filter".to_string(),
        format!("label={}", DEPLOYMENT_LABEL),
        "--format".to_string(),
        "{{json .}}".to_string(),
    ]
}

pub fn generate_stats_args(container: &str) -> Vec<String> {
    vec![
        "stats".to_string(),
        "--no-stream".to_string(),
        "--format".to_string(),
        "{{json .}}".to_string(),
        container.to_string(),
    ]
}

/// `huggingface-cli download` arguments
pub fn generate_hf_download_args(request: &ModelDownloadPayload, target: &Path) -> Vec<String> {
    let mut args = vec![
        "download".to_string(),
        request.source_path.clone(),
        "--local-dir".to_string(),
        target.display().to_string(),
    ];
    if let Some(version) = &request.version {
        args.push("--revision".to_string());
        args.push(version.clone());
    }
    args
}

/// Relative model paths live under the model directory
pub fn resolve_model_path(model_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        model_dir.join(path)
    }
}

/// One `{{json .}}` object per line
pub fn parse_json_lines(output: &str) -> Vec<Value> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

/// Parse a `docker logs --timestamps` line
pub fn parse_log_line(line: &str, source: LogSource) -> LogEntry {
    let (timestamp, message) = match line.split_once(' ') {
        Some((ts, rest)) => match DateTime::parse_from_rfc3339(ts) {
            Ok(ts) => (ts.with_timezone(&Utc), rest),
            Err(_) => (Utc::now(), line),
        },
        None => (Utc::now(), line),
    };

    let upper = message.to_ascii_uppercase();
    let level = if upper.contains("ERROR") {
        LogLevel::Error
    } else if upper.contains("WARN") {
        LogLevel::Warn
    } else if upper.contains("DEBUG") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    LogEntry {
        timestamp,
        level,
        source,
        message: message.to_string(),
    }
}

fn progress_percent(downloaded: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => ((downloaded.min(total) * 100) / total) as u8,
        _ => 0,
    }
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    }
}

// ============================================================================
// Executor
// ============================================================================

pub struct DockerExecutor {
    config: DockerConfig,
    model_dir: PathBuf,
    gpus: Vec<GpuDevice>,
    advertise_host: String,
    containers: DashMap<String, DeploymentContainer>,
    http: reqwest::Client,
}

impl DockerExecutor {
    pub fn new(config: DockerConfig, model_dir: PathBuf, gpus: Vec<GpuDevice>) -> Self {
        Self {
            config,
            model_dir,
            gpus,
            advertise_host: "127.0.0.1".to_string(),
            containers: DashMap::new(),
            http: reqwest::Client::new(),
        }
    }

    /// Host used in the endpoints reported for deployments
    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }

    async fn docker(&self, args: &[String]) -> Result<String, ExecutorError> {
        debug!("{} {}", self.config.binary, args.join(" "));
        let output = Command::new(&self.config.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                ExecutorError::ContainerFailed(format!(
                    "failed to run {}: {}",
                    self.config.binary, e
                ))
            })?;

        if !output.status.success() {
            let message = failure_message(&output);
            if message.contains("No such container") || message.contains("No such object") {
                return Err(ExecutorError::NotFound(message));
            }
            return Err(ExecutorError::ContainerFailed(message));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn known(&self, deployment_id: &str) -> Result<DeploymentContainer, ExecutorError> {
        self.containers
            .get(deployment_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| ExecutorError::NotFound(deployment_id.to_string()))
    }

    async fn start_container(
        &self,
        deployment_id: &str,
        spec: &DeploymentCreatePayload,
    ) -> Result<DeploymentContainer, ExecutorError> {
        // A leftover container with the same name would make `run` fail
        if let Err(e) = self.docker(&generate_rm_args(&spec.container_name, true)).await {
            debug!("No stale container {}: {}", spec.container_name, e);
        }

        let container_id = self
            .docker(&generate_run_args(&self.config, deployment_id, spec))
            .await?;
        info!(
            "Started container {} for deployment {} on GPU {}",
            spec.container_name, deployment_id, spec.gpu_device_id
        );

        let container = DeploymentContainer {
            deployment_id: deployment_id.to_string(),
            container_id,
            container_name: spec.container_name.clone(),
            endpoint: format!("http://{}:{}", self.advertise_host, spec.container_port),
            gpu_device_id: spec.gpu_device_id.clone(),
            started_at: Utc::now(),
            running: true,
            spec: Some(spec.clone()),
        };
        self.containers
            .insert(deployment_id.to_string(), container.clone());
        Ok(container)
    }

    async fn download_http(
        &self,
        request: &ModelDownloadPayload,
        model_id: &str,
        target: &Path,
        progress: &ProgressSink,
    ) -> Result<u64, ExecutorError> {
        let mut call = self.http.get(&request.source_path);
        if let Some(token) = request.credentials.as_ref().and_then(|c| c.get("token")) {
            call = call.bearer_auth(token);
        }
        let response = call
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ExecutorError::Download(e.to_string()))?;

        let total = response.content_length();
        let mut file = tokio::fs::File::create(target).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        let mut reported = 0u8;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ExecutorError::Download(e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let percent = progress_percent(downloaded, total);
            if percent >= reported.saturating_add(PROGRESS_STEP) && percent < 100 {
                reported = percent;
                progress(ModelDownloadProgressPayload {
                    model_id: model_id.to_string(),
                    progress: percent,
                    bytes_downloaded: downloaded,
                    total_bytes: total,
                });
            }
        }
        file.flush().await?;
        Ok(downloaded)
    }

    async fn download_huggingface(
        &self,
        request: &ModelDownloadPayload,
        target: &Path,
    ) -> Result<u64, ExecutorError> {
        let mut cmd = Command::new("huggingface-cli");
        cmd.args(generate_hf_download_args(request, target));
        if let Some(token) = request.credentials.as_ref().and_then(|c| c.get("token")) {
            cmd.env("HF_TOKEN", token);
        }

        let output = cmd.output().await.map_err(|e| {
            ExecutorError::Download(format!("failed to run huggingface-cli: {}", e))
        })?;
        if !output.status.success() {
            return Err(ExecutorError::Download(failure_message(&output)));
        }
        size_on_disk(target.to_path_buf()).await
    }

    fn model_path(&self, model: &ModelRefPayload) -> PathBuf {
        match &model.path {
            Some(path) => resolve_model_path(&self.model_dir, path),
            None => self.model_dir.join(&model.model_id),
        }
    }
}

/// Bytes under `path`, whether it is a file or a directory
async fn size_on_disk(path: PathBuf) -> Result<u64, ExecutorError> {
    fn walk(path: &Path) -> std::io::Result<u64> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_dir() {
            return Ok(meta.len());
        }
        let mut total = 0;
        for entry in std::fs::read_dir(path)? {
            total += walk(&entry?.path())?;
        }
        Ok(total)
    }

    tokio::task::spawn_blocking(move || walk(&path))
        .await
        .map_err(|e| ExecutorError::Io(std::io::Error::other(e)))?
        .map_err(ExecutorError::from)
}

fn not_found_as(model_id: &str, e: std::io::Error) -> ExecutorError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ExecutorError::ModelNotFound(model_id.to_string())
    } else {
        ExecutorError::Io(e)
    }
}

#[async_trait]
impl CommandExecutor for DockerExecutor {
    async fn runtime(&self) -> Result<ContainerRuntime, ExecutorError> {
        let version = self
            .docker(&[
                "version".to_string(),
                "--format".to_string(),
                "{{.Server.Version}}".to_string(),
            ])
            .await?;
        let root_dir = self
            .docker(&[
                "info".to_string(),
                "--format".to_string(),
                "{{.DockerRootDir}}".to_string(),
            ])
            .await
            .unwrap_or_default();

        Ok(ContainerRuntime {
            runtime_type: "docker".to_string(),
            version,
            root_dir,
        })
    }

    fn gpus(&self) -> Vec<GpuDevice> {
        self.gpus.clone()
    }

    async fn create_deployment(
        &self,
        deployment_id: &str,
        spec: &DeploymentCreatePayload,
    ) -> Result<DeploymentContainer, ExecutorError> {
        if matches!(self.containers.get(deployment_id), Some(c) if c.running) {
            return Err(ExecutorError::AlreadyRunning(deployment_id.to_string()));
        }
        check_placement(spec, &self.gpus)?;
        self.start_container(deployment_id, spec).await
    }

    async fn stop_deployment(
        &self,
        deployment_id: &str,
        options: &DeploymentStopPayload,
    ) -> Result<DeploymentContainer, ExecutorError> {
        let container = self.known(deployment_id)?;
        if !container.running {
            return Err(ExecutorError::NotRunning(deployment_id.to_string()));
        }

        let args = if options.force {
            generate_kill_args(&container.container_name)
        } else {
            generate_stop_args(&container.container_name, options.effective_timeout())
        };
        let limit = Duration::from_secs(options.effective_timeout()) + STOP_GRACE;
        tokio::time::timeout(limit, self.docker(&args))
            .await
            .map_err(|_| ExecutorError::Timeout(limit))??;

        let mut stopped = container;
        stopped.running = false;
        self.containers
            .insert(deployment_id.to_string(), stopped.clone());
        info!("Stopped deployment {}", deployment_id);
        Ok(stopped)
    }

    async fn restart_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<DeploymentContainer, ExecutorError> {
        let container = self.known(deployment_id)?;
        self.docker(&generate_restart_args(&container.container_name))
            .await?;

        let mut restarted = container;
        restarted.running = true;
        restarted.started_at = Utc::now();
        self.containers
            .insert(deployment_id.to_string(), restarted.clone());
        Ok(restarted)
    }

    async fn update_deployment(
        &self,
        deployment_id: &str,
        changes: &DeploymentUpdatePayload,
    ) -> Result<DeploymentContainer, ExecutorError> {
        let current = self.known(deployment_id)?;
        let spec = current
            .spec
            .as_ref()
            .map(|s| merge_update(s, changes))
            .ok_or_else(|| ExecutorError::NotFound(deployment_id.to_string()))?;
        check_placement(&spec, &self.gpus)?;
        self.start_container(deployment_id, &spec).await
    }

    async fn delete_deployment(
        &self,
        deployment_id: &str,
        force: bool,
    ) -> Result<(), ExecutorError> {
        let container = self.known(deployment_id)?;
        if container.running && !force {
            return Err(ExecutorError::AlreadyRunning(deployment_id.to_string()));
        }
        match self
            .docker(&generate_rm_args(&container.container_name, force))
            .await
        {
            Ok(_) | Err(ExecutorError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.containers.remove(deployment_id);
        info!("Removed deployment {}", deployment_id);
        Ok(())
    }

    fn deployment(&self, deployment_id: &str) -> Option<DeploymentContainer> {
        self.containers.get(deployment_id).map(|c| c.value().clone())
    }

    fn deployments(&self) -> Vec<DeploymentContainer> {
        let mut all: Vec<_> = self.containers.iter().map(|c| c.value().clone()).collect();
        all.sort_by(|a, b| a.deployment_id.cmp(&b.deployment_id));
        all
    }

    async fn deployment_logs(
        &self,
        deployment_id: &str,
        tail: u32,
    ) -> Result<Vec<LogEntry>, ExecutorError> {
        let container = self.known(deployment_id)?;
        let output = Command::new(&self.config.binary)
            .args(generate_logs_args(&container.container_name, Some(tail)))
            .output()
            .await?;
        if !output.status.success() {
            return Err(ExecutorError::ContainerFailed(failure_message(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut entries: Vec<_> = stdout
            .lines()
            .map(|l| parse_log_line(l, LogSource::Stdout))
            .chain(stderr.lines().map(|l| parse_log_line(l, LogSource::Stderr)))
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    async fn download_model(
        &self,
        request: &ModelDownloadPayload,
        progress: ProgressSink,
    ) -> Result<ModelInfo, ExecutorError> {
        let model_id = request
            .model_id
            .clone()
            .unwrap_or_else(|| request.source_path.clone());
        let target = resolve_model_path(&self.model_dir, &request.target_path);
        if request.source == ModelSource::Minio {
            return Err(ExecutorError::Unsupported(
                "minio model sources are not supported by this worker".to_string(),
            ));
        }

        progress(ModelDownloadProgressPayload {
            model_id: model_id.clone(),
            progress: 0,
            bytes_downloaded: 0,
            total_bytes: None,
        });

        let size = match request.source {
            ModelSource::Http => {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                self.download_http(request, &model_id, &target, &progress)
                    .await?
            }
            ModelSource::Huggingface | ModelSource::Minio => {
                tokio::fs::create_dir_all(&target).await?;
                self.download_huggingface(request, &target).await?
            }
        };

        progress(ModelDownloadProgressPayload {
            model_id: model_id.clone(),
            progress: 100,
            bytes_downloaded: size,
            total_bytes: Some(size),
        });
        info!("Downloaded model {} to {} ({} bytes)", model_id, target.display(), size);

        Ok(ModelInfo {
            model_id,
            path: target,
            size_bytes: size,
        })
    }

    async fn inspect_model(&self, model: &ModelRefPayload) -> Result<ModelInfo, ExecutorError> {
        let path = self.model_path(model);
        let size = size_on_disk(path.clone()).await.map_err(|e| match e {
            ExecutorError::Io(io) => not_found_as(&model.model_id, io),
            other => other,
        })?;
        Ok(ModelInfo {
            model_id: model.model_id.clone(),
            path,
            size_bytes: size,
        })
    }

    async fn delete_model(&self, model: &ModelRefPayload) -> Result<(), ExecutorError> {
        let path = self.model_path(model);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| not_found_as(&model.model_id, e))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        info!("Deleted model {} at {}", model.model_id, path.display());
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ExecutorError> {
        let mut entries = match tokio::fs::read_dir(&self.model_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut models = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let size = match size_on_disk(path.clone()).await {
                Ok(size) => size,
                Err(e) => {
                    warn!("Skipping unreadable model {}: {}", path.display(), e);
                    continue;
                }
            };
            models.push(ModelInfo {
                model_id: entry.file_name().to_string_lossy().into_owned(),
                path,
                size_bytes: size,
            });
        }
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    async fn list_containers(&self) -> Result<Value, ExecutorError> {
        let output = self.docker(&generate_ps_args()).await?;
        Ok(Value::Array(parse_json_lines(&output)))
    }

    async fn inspect_container(&self, container_id: &str) -> Result<Value, ExecutorError> {
        let output = self
            .docker(&["inspect".to_string(), container_id.to_string()])
            .await?;
        let parsed: Value = serde_json::from_str(&output)
            .map_err(|e| ExecutorError::ContainerFailed(e.to_string()))?;
        match parsed {
            Value::Array(mut items) if !items.is_empty() => Ok(items.swap_remove(0)),
            _ => Err(ExecutorError::NotFound(container_id.to_string())),
        }
    }

    async fn container_logs(
        &self,
        container_id: &str,
        tail: Option<u32>,
    ) -> Result<Vec<String>, ExecutorError> {
        let output = self
            .docker(&generate_logs_args(container_id, tail))
            .await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    async fn container_stats(&self, container_id: &str) -> Result<Value, ExecutorError> {
        let output = self.docker(&generate_stats_args(container_id)).await?;
        parse_json_lines(&output)
            .into_iter()
            .next()
            .ok_or_else(|| ExecutorError::NotFound(container_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::executor::tests::create_spec;

    #[test]
    fn test_generate_run_args() {
        let config = DockerConfig {
            network: Some("inference".to_string()),
            extra_args: vec!["--shm-size".to_string(), "16g".to_string()],
            ..Default::default()
        };
        let args = generate_run_args(&config, "d1", &create_spec());

        assert_eq!(&args[..2], &["run", "-d"]);
        assert!(args.contains(&"llama-3-8b-d1".to_string()));
        assert!(args.contains(&"nodelink.deployment=d1".to_string()));
        assert!(args.contains(&"device=0".to_string()));
        assert!(args.contains(&"8000:8000".to_string()));
        assert!(args.contains(&"inference".to_string()));
        assert!(args.contains(&"/models/llama-3-8b:/models/llama-3-8b:ro".to_string()));
        assert!(args.contains(&"GPU_MEMORY_LIMIT_MB=16384".to_string()));
        assert!(args.contains(&"HF_HOME=/models".to_string()));
        assert!(args.contains(&"--shm-size".to_string()));
        assert_eq!(args.last().unwrap(), "vllm/vllm-openai:latest");
    }

    #[test]
    fn test_generate_stop_args() {
        assert_eq!(generate_stop_args("c1", 30), vec!["stop", "-t", "30", "c1"]);
        assert_eq!(generate_kill_args("c1"), vec!["kill", "c1"]);
    }

    #[test]
    fn test_generate_rm_args() {
        assert_eq!(generate_rm_args("c1", true), vec!["rm", "-f", "c1"]);
        assert_eq!(generate_rm_args("c1", false), vec!["rm", "c1"]);
    }

    #[test]
    fn test_generate_logs_args() {
        assert_eq!(
            generate_logs_args("c1", Some(50)),
            vec!["logs", "--timestamps", "--tail", "50", "c1"]
        );
        assert_eq!(generate_logs_args("c1", None), vec!["logs", "--timestamps", "c1"]);
    }

    #[test]
    fn test_generate_hf_download_args() {
        let request = ModelDownloadPayload {
            model_id: None,
            source: ModelSource::Huggingface,
            source_path: "meta-llama/Llama-3-8B".to_string(),
            version: Some("main".to_string()),
            target_path: "llama-3-8b".to_string(),
            credentials: None,
        };
        let args = generate_hf_download_args(&request, Path::new("/models/llama-3-8b"));
        assert_eq!(
            args,
            vec![
                "download",
                "meta-llama/Llama-3-8B",
                "--local-dir",
                "/models/llama-3-8b",
                "--revision",
                "main"
            ]
        );
    }

    #[test]
    fn test_resolve_model_path() {
        let dir = Path::new("/var/lib/models");
        assert_eq!(
            resolve_model_path(dir, "llama"),
            PathBuf::from("/var/lib/models/llama")
        );
        assert_eq!(resolve_model_path(dir, "/data/llama"), PathBuf::from("/data/llama"));
    }

    #[test]
    fn test_parse_log_line() {
        let entry = parse_log_line(
            "2024-05-01T10:00:00.123456789Z ERROR: CUDA out of memory",
            LogSource::Stderr,
        );
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.source, LogSource::Stderr);
        assert_eq!(entry.message, "ERROR: CUDA out of memory");
        assert_eq!(entry.timestamp.to_rfc3339(), "2024-05-01T10:00:00.123456789+00:00");

        let plain = parse_log_line("no timestamp here", LogSource::Stdout);
        assert_eq!(plain.level, LogLevel::Info);
        assert_eq!(plain.message, "no timestamp here");
    }

    #[test]
    fn test_parse_json_lines() {
        let output = "{\"ID\":\"a\"}\n\n{\"ID\":\"b\"}\nnot json\n";
        let parsed = parse_json_lines(output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1]["ID"], "b");
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(50, Some(200)), 25);
        assert_eq!(progress_percent(500, Some(200)), 100);
        assert_eq!(progress_percent(50, None), 0);
    }

    #[tokio::test]
    async fn test_placement_checked_before_docker() {
        let executor = DockerExecutor::new(
            DockerConfig {
                binary: "/nonexistent/docker".to_string(),
                ..Default::default()
            },
            PathBuf::from("/tmp"),
            vec![],
        );
        let err = executor
            .create_deployment("d1", &create_spec())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::protocol::ErrorCode::GpuUnavailable);
    }

    #[tokio::test]
    async fn test_missing_docker_binary() {
        let executor = DockerExecutor::new(
            DockerConfig {
                binary: "/nonexistent/docker".to_string(),
                ..Default::default()
            },
            PathBuf::from("/tmp"),
            vec![],
        );
        let err = executor.runtime().await.unwrap_err();
        assert_eq!(err.code(), crate::protocol::ErrorCode::ContainerStartFailed);
    }

    #[tokio::test]
    async fn test_model_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("llama")).unwrap();
        std::fs::write(dir.path().join("llama/weights.bin"), vec![0u8; 128]).unwrap();
        let executor =
            DockerExecutor::new(DockerConfig::default(), dir.path().to_path_buf(), vec![]);

        let models = executor.list_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].size_bytes, 128);

        let llama = ModelRefPayload {
            model_id: "llama".to_string(),
            path: None,
        };
        assert_eq!(executor.inspect_model(&llama).await.unwrap().size_bytes, 128);
        executor.delete_model(&llama).await.unwrap();
        let err = executor.inspect_model(&llama).await.unwrap_err();
        assert_eq!(err.code(), crate::protocol::ErrorCode::ModelNotFound);
    }

    #[tokio::test]
    async fn test_minio_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let executor =
            DockerExecutor::new(DockerConfig::default(), dir.path().to_path_buf(), vec![]);
        let request = ModelDownloadPayload {
            model_id: Some("m".to_string()),
            source: ModelSource::Minio,
            source_path: "bucket/m".to_string(),
            version: None,
            target_path: "m".to_string(),
            credentials: None,
        };
        let sink: ProgressSink = std::sync::Arc::new(|_: ModelDownloadProgressPayload| {});
        let err = executor.download_model(&request, sink).await.unwrap_err();
        assert_eq!(err.code(), crate::protocol::ErrorCode::CommandInvalid);
    }
}

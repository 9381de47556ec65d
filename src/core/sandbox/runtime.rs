//! Container runtime client used by the sandbox pool.
//!
//! The pool only needs run/stop/inspect/port-query plus named-volume
//! provisioning, so the surface is a small trait. The default implementation
//! shells out to the `docker` CLI; tests substitute an in-memory runtime.

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("container runtime failure: {0}")]
    Runtime(String),
    #[error("container {name} failed to reach running state within {timeout_secs}s")]
    StartTimeout { name: String, timeout_secs: u64 },
    #[error("container {0} has no host port mapping")]
    MissingPortMapping(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

impl ContainerState {
    fn parse(value: &str) -> Self {
        match value.trim() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "exited" | "dead" | "removing" => ContainerState::Exited,
            _ => ContainerState::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Named volume bound at /workspace inside the container.
    pub volume: String,
    /// Container port published to a dynamically assigned host port.
    pub agent_port: u16,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ensure_volume(&self, name: &str) -> Result<(), ProvisionError>;
    async fn run(&self, spec: &ContainerSpec) -> Result<(), ProvisionError>;
    async fn state(&self, name: &str) -> Result<ContainerState, ProvisionError>;
    async fn host_port(&self, name: &str, container_port: u16)
    -> Result<Option<u16>, ProvisionError>;
    async fn stop(&self, name: &str, grace_secs: u64) -> Result<(), ProvisionError>;
}

/// Docker CLI-backed runtime.
pub struct DockerRuntime;

impl DockerRuntime {
    pub fn new() -> Self {
        Self
    }

    async fn docker(args: &[&str]) -> Result<String, ProvisionError> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| ProvisionError::Runtime(format!("failed to spawn docker: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisionError::Runtime(stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_volume(&self, name: &str) -> Result<(), ProvisionError> {
        // `docker volume create` is idempotent for an existing name.
        Self::docker(&["volume", "create", name]).await.map(|_| ())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<(), ProvisionError> {
        let volume_bind = format!("{}:/workspace:rw", spec.volume);
        let publish = format!("127.0.0.1::{}", spec.agent_port);

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--name".into(),
            spec.name.clone(),
            "-v".into(),
            volume_bind,
            "-p".into(),
            publish,
        ];
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.labels {
            args.push("-l".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Self::docker(&arg_refs).await.map(|_| ())
    }

    async fn state(&self, name: &str) -> Result<ContainerState, ProvisionError> {
        let raw = Self::docker(&["inspect", "-f", "{{.State.Status}}", name]).await?;
        Ok(ContainerState::parse(&raw))
    }

    async fn host_port(
        &self,
        name: &str,
        container_port: u16,
    ) -> Result<Option<u16>, ProvisionError> {
        let spec = format!("{container_port}/tcp");
        let raw = match Self::docker(&["port", name, &spec]).await {
            Ok(out) => out,
            // `docker port` fails for an unpublished port; treat as absent.
            Err(ProvisionError::Runtime(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let port = raw
            .lines()
            .next()
            .and_then(|line| line.rsplit(':').next())
            .and_then(|p| p.trim().parse::<u16>().ok());
        Ok(port)
    }

    async fn stop(&self, name: &str, grace_secs: u64) -> Result<(), ProvisionError> {
        let grace = grace_secs.to_string();
        Self::docker(&["stop", "-t", &grace, name]).await.map(|_| ())
    }
}

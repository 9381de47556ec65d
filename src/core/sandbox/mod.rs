//! Sandbox pool: owns the map of live containers and which session currently
//! occupies each one.
//!
//! A container is torn down if and only if no session references it anymore
//! and its mode is ephemeral. Persistent containers survive run completion
//! and are only removed by explicit operator action (`force_delete`) or
//! cancellation. Teardown failures are logged and swallowed so the
//! accounting can never get stuck on a dead container.

pub mod runtime;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tracing::{info, warn};
use uuid::Uuid;

pub use runtime::{ContainerRuntime, ContainerSpec, ContainerState, DockerRuntime, ProvisionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    Ephemeral,
    Persistent,
}

impl SandboxMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxMode::Ephemeral => "ephemeral",
            SandboxMode::Persistent => "persistent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ephemeral" => Some(SandboxMode::Ephemeral),
            "persistent" => Some(SandboxMode::Persistent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    pub agent_port: u16,
    pub ready_timeout_secs: u64,
    pub ready_poll_ms: u64,
    pub stop_grace_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "drydock-executor:latest".to_string(),
            agent_port: 8000,
            ready_timeout_secs: 30,
            ready_poll_ms: 1000,
            stop_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
struct SandboxHandle {
    container_id: String,
    name: String,
    endpoint: String,
    mode: SandboxMode,
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub endpoint: String,
    pub container_id: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerStats {
    pub container_id: String,
    pub name: String,
    pub mode: SandboxMode,
    pub sessions: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub total_active: usize,
    pub ephemeral: usize,
    pub persistent: usize,
    pub containers: Vec<ContainerStats>,
}

#[derive(Default)]
struct PoolState {
    containers: HashMap<String, SandboxHandle>,
    session_to_container: HashMap<Uuid, String>,
}

pub struct SandboxPool {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
    state: Mutex<PoolState>,
}

impl SandboxPool {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Self {
        Self {
            runtime,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Map the session onto a sandbox and return its endpoint. Supplying a
    /// tracked `existing_container_id` remaps onto that container (the
    /// persistent-session resume path); otherwise a fresh container is
    /// provisioned with a session-scoped workspace volume and a dynamically
    /// published agent port, blocking until it reports running.
    pub async fn acquire(
        &self,
        session_id: Uuid,
        owner_id: &str,
        mode: SandboxMode,
        existing_container_id: Option<&str>,
    ) -> Result<Allocation, ProvisionError> {
        if let Some(existing) = existing_container_id {
            let mut state = self.state.lock().await;
            if let Some(handle) = state.containers.get(existing) {
                info!(
                    "Reusing sandbox {} for session {}",
                    existing, session_id
                );
                let endpoint = handle.endpoint.clone();
                state
                    .session_to_container
                    .insert(session_id, existing.to_string());
                return Ok(Allocation {
                    endpoint,
                    container_id: existing.to_string(),
                });
            }
            // The container vanished since the session last ran; provision a
            // fresh one below.
        }

        let short = session_id.simple().to_string()[..8].to_string();
        let container_id = format!("sbx-{short}");
        let name = format!("drydock-{short}");
        let volume = format!("drydock-ws-{short}");

        info!(
            "Provisioning sandbox {} for session {} (mode: {})",
            container_id,
            session_id,
            mode.as_str()
        );

        self.runtime.ensure_volume(&volume).await?;

        let spec = ContainerSpec {
            name: name.clone(),
            image: self.config.image.clone(),
            volume,
            agent_port: self.config.agent_port,
            env: vec![
                ("WORKSPACE_PATH".to_string(), "/workspace".to_string()),
                ("SESSION_ID".to_string(), session_id.to_string()),
                ("OWNER_ID".to_string(), owner_id.to_string()),
            ],
            labels: vec![
                ("owner".to_string(), owner_id.to_string()),
                ("session_id".to_string(), session_id.to_string()),
                ("container_id".to_string(), container_id.clone()),
                ("container_mode".to_string(), mode.as_str().to_string()),
            ],
        };
        self.runtime.run(&spec).await?;
        self.wait_until_running(&name).await?;

        let port = self
            .runtime
            .host_port(&name, self.config.agent_port)
            .await?
            .ok_or_else(|| ProvisionError::MissingPortMapping(name.clone()))?;
        let endpoint = format!("http://127.0.0.1:{port}");

        let mut state = self.state.lock().await;
        state.containers.insert(
            container_id.clone(),
            SandboxHandle {
                container_id: container_id.clone(),
                name,
                endpoint: endpoint.clone(),
                mode,
            },
        );
        state
            .session_to_container
            .insert(session_id, container_id.clone());

        info!(
            "Sandbox {} ready for session {} at {}",
            container_id, session_id, endpoint
        );
        Ok(Allocation {
            endpoint,
            container_id,
        })
    }

    async fn wait_until_running(&self, name: &str) -> Result<(), ProvisionError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.ready_timeout_secs);
        loop {
            if self.runtime.state(name).await? == ContainerState::Running {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProvisionError::StartTimeout {
                    name: name.to_string(),
                    timeout_secs: self.config.ready_timeout_secs,
                });
            }
            sleep(Duration::from_millis(self.config.ready_poll_ms)).await;
        }
    }

    /// Drop the session's mapping. The container is only torn down when this
    /// was its last reference and it is ephemeral.
    pub async fn release(&self, session_id: Uuid) {
        let to_teardown = {
            let mut state = self.state.lock().await;
            let Some(container_id) = state.session_to_container.remove(&session_id) else {
                warn!("Session {} has no sandbox mapping", session_id);
                return;
            };

            let still_referenced = state
                .session_to_container
                .values()
                .any(|cid| cid == &container_id);
            if still_referenced {
                info!("Sandbox {} still referenced by other sessions", container_id);
                None
            } else {
                match state.containers.get(&container_id).map(|h| h.mode) {
                    Some(SandboxMode::Ephemeral) => state.containers.remove(&container_id),
                    Some(SandboxMode::Persistent) => {
                        info!("Sandbox {} is persistent, keeping alive", container_id);
                        None
                    }
                    None => None,
                }
            }
        };

        if let Some(handle) = to_teardown {
            self.teardown(handle).await;
        }
    }

    /// Unconditional teardown regardless of reference count or mode. Every
    /// session mapped to the container is unmapped first.
    pub async fn force_delete(&self, container_id: &str) {
        let handle = {
            let mut state = self.state.lock().await;
            state
                .session_to_container
                .retain(|_, cid| cid != container_id);
            state.containers.remove(container_id)
        };

        match handle {
            Some(handle) => self.teardown(handle).await,
            None => warn!("Sandbox {} is not tracked", container_id),
        }
    }

    /// User-initiated cancellation: hard stop of the session's sandbox.
    pub async fn cancel(&self, session_id: Uuid) {
        let container_id = {
            let state = self.state.lock().await;
            state.session_to_container.get(&session_id).cloned()
        };

        match container_id {
            Some(container_id) => {
                info!("Cancelling sandbox for session {}", session_id);
                self.force_delete(&container_id).await;
            }
            None => warn!("Session {} has no sandbox", session_id),
        }
    }

    async fn teardown(&self, handle: SandboxHandle) {
        // A failed stop must not resurrect the mapping; log and move on.
        match self
            .runtime
            .stop(&handle.name, self.config.stop_grace_secs)
            .await
        {
            Ok(()) => info!("Sandbox {} stopped", handle.container_id),
            Err(e) => warn!("Failed to stop sandbox {}: {}", handle.container_id, e),
        }
    }

    /// Point-in-time counts for observability; no side effects.
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;

        let mut sessions_by_container: HashMap<&str, usize> = HashMap::new();
        for container_id in state.session_to_container.values() {
            *sessions_by_container
                .entry(container_id.as_str())
                .or_insert(0) += 1;
        }

        let mut ephemeral = 0;
        let mut persistent = 0;
        let mut containers = Vec::new();
        for handle in state.containers.values() {
            match handle.mode {
                SandboxMode::Ephemeral => ephemeral += 1,
                SandboxMode::Persistent => persistent += 1,
            }
            containers.push(ContainerStats {
                container_id: handle.container_id.clone(),
                name: handle.name.clone(),
                mode: handle.mode,
                sessions: sessions_by_container
                    .get(handle.container_id.as_str())
                    .copied()
                    .unwrap_or(0),
            });
        }

        PoolStats {
            total_active: state.containers.len(),
            ephemeral,
            persistent,
            containers,
        }
    }
}

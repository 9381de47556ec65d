//! Daemon configuration: `config.toml` in the data directory, with
//! environment overrides for the knobs that deployment scripts touch.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::core::dispatch::DispatchConfig;
use crate::core::gate::GateConfig;
use crate::core::sandbox::SandboxConfig;
use crate::platform::{NativePlatform, Platform};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub api_host: String,
    pub api_port: u16,
    /// Shared secret for trusted internal callers. Generated at boot when
    /// neither the config file nor the environment provides one.
    pub internal_token: String,
    /// Owner recorded on sessions/tasks when the caller does not say.
    pub default_owner: String,
    pub sandbox: SandboxConfig,
    pub dispatch: DispatchConfig,
    pub gate: GateConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_host: "127.0.0.1".to_string(),
            api_port: 7810,
            internal_token: String::new(),
            default_owner: "local".to_string(),
            sandbox: SandboxConfig::default(),
            dispatch: DispatchConfig::default(),
            gate: GateConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("config.toml");
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {path:?}"))?;
            toml::from_str(&raw).with_context(|| format!("invalid config at {path:?}"))?
        } else {
            Self::default()
        };

        if let Ok(host) = std::env::var("DRYDOCK_API_HOST") {
            config.api_host = host;
        }
        if let Ok(port) = std::env::var("DRYDOCK_API_PORT") {
            if let Ok(port) = port.parse() {
                config.api_port = port;
            }
        }
        if let Ok(token) = std::env::var("DRYDOCK_INTERNAL_TOKEN") {
            config.internal_token = token;
        }
        if let Ok(image) = std::env::var("DRYDOCK_SANDBOX_IMAGE") {
            config.sandbox.image = image;
        }
        if config.internal_token.trim().is_empty() {
            config.internal_token = Uuid::new_v4().simple().to_string();
        }
        Ok(config)
    }
}

/// Root data directory: `DRYDOCK_DATA_DIR` when set, `~/.drydock` otherwise.
pub fn data_dir() -> PathBuf {
    std::env::var("DRYDOCK_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| NativePlatform::data_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults_with_generated_token() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = DaemonConfig::load(dir.path()).expect("load");
        assert_eq!(config.api_host, "127.0.0.1");
        assert!(!config.internal_token.is_empty());
        assert_eq!(config.dispatch.batch_limit, 50);
    }

    #[test]
    fn config_file_overrides_are_partial() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(
            dir.path().join("config.toml"),
            "api_port = 9001\n\n[sandbox]\nimage = \"custom-executor:dev\"\n",
        )
        .expect("write config");

        let config = DaemonConfig::load(dir.path()).expect("load");
        assert_eq!(config.api_port, 9001);
        assert_eq!(config.sandbox.image, "custom-executor:dev");
        // Untouched sections keep their defaults.
        assert_eq!(config.gate.plan_timeout_secs, 600);
    }
}

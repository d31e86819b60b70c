//! Tunnel settings, loadable from a JSON file.

use crate::cache::ReusePolicy;
use crate::ssh::HostKeyPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How tunnels are opened and reused.
///
/// Every field has a default, so a config file only needs the keys it changes:
///
/// ```json
/// { "host_key_policy": "accept-new", "connect_timeout_secs": 10 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// ssh executable
    pub ssh_program: String,
    /// Loopback address the forward binds to
    pub local_bind_host: String,
    pub host_key_policy: HostKeyPolicy,
    pub reuse_policy: ReusePolicy,
    /// ssh ConnectTimeout; absent means no bound
    pub connect_timeout_secs: Option<u64>,
    /// Deadline for ssh to bring the forward up; absent means no bound
    pub startup_timeout_ms: Option<u64>,
    pub server_alive_interval_secs: u32,
    pub server_alive_count_max: u32,
    /// Passed to ssh before the destination
    pub extra_args: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            local_bind_host: "127.0.0.1".to_string(),
            host_key_policy: HostKeyPolicy::default(),
            reuse_policy: ReusePolicy::default(),
            connect_timeout_secs: None,
            startup_timeout_ms: None,
            server_alive_interval_secs: 15,
            server_alive_count_max: 3,
            extra_args: Vec::new(),
        }
    }
}

impl TunnelConfig {
    /// Read a JSON config file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = async_fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read tunnel config {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid tunnel config {}", path.display()))?;
        tracing::debug!("Loaded tunnel config from {}", path.display());
        Ok(config)
    }

    /// Load `~/.ssh-db-tunnel/config.json`, or defaults if it does not exist.
    pub async fn load_default() -> Result<Self> {
        let path = Self::default_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path).await
    }

    pub fn default_path() -> Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".ssh-db-tunnel").join("config.json"))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn with_reuse_policy(mut self, policy: ReusePolicy) -> Self {
        self.reuse_policy = policy;
        self
    }
}

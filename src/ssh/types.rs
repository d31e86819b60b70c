//! SSH tunnel configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Authentication method for SSH connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SshAuthMethod {
    /// Use ssh-agent or whatever the system ssh config provides
    #[default]
    Agent,
    /// Private key file with optional passphrase
    PublicKey {
        private_key_path: String,
        passphrase: Option<String>,
    },
}

/// How the bastion's host key is checked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Host must already be in known_hosts
    #[default]
    Verify,
    /// Unknown hosts are added, changed keys are refused
    AcceptNew,
    /// No verification at all. Legacy behavior; opt-in only
    Disabled,
}

impl HostKeyPolicy {
    /// `-o` arguments for the ssh command line.
    pub fn ssh_options(&self) -> Vec<String> {
        match self {
            HostKeyPolicy::Verify => vec!["StrictHostKeyChecking=yes".to_string()],
            HostKeyPolicy::AcceptNew => vec!["StrictHostKeyChecking=accept-new".to_string()],
            HostKeyPolicy::Disabled => vec![
                "StrictHostKeyChecking=no".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ],
        }
    }
}

/// Configuration for an SSH tunnel using the system ssh binary
#[derive(Debug, Clone)]
pub struct SshTunnelConfig {
    /// ssh executable
    pub program: String,
    /// SSH server hostname
    pub ssh_host: String,
    /// SSH server port (default: 22)
    pub ssh_port: u16,
    /// SSH username
    pub ssh_user: String,
    /// Authentication method
    pub auth_method: SshAuthMethod,
    /// Remote host to tunnel to (as seen from SSH server)
    pub remote_host: String,
    /// Remote port to tunnel to
    pub remote_port: u16,
    /// Local bind address (default: 127.0.0.1)
    pub local_bind_host: String,
    /// Local port to bind (0 for auto-assign)
    pub local_bind_port: u16,
    pub host_key_policy: HostKeyPolicy,
    /// ssh ConnectTimeout; `None` leaves the system default
    pub connect_timeout: Option<Duration>,
    /// Deadline for the whole startup, handshake included; `None` waits until
    /// ssh either exits or the forwarded port accepts connections
    pub startup_timeout: Option<Duration>,
    pub server_alive_interval: u32,
    pub server_alive_count_max: u32,
    /// Additional SSH arguments (e.g., from user's config)
    pub extra_args: Vec<String>,
}

impl SshTunnelConfig {
    /// Agent-authenticated tunnel with default options.
    pub fn new(
        ssh_host: impl Into<String>,
        ssh_port: u16,
        ssh_user: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            program: "ssh".to_string(),
            ssh_host: ssh_host.into(),
            ssh_port,
            ssh_user: ssh_user.into(),
            auth_method: SshAuthMethod::Agent,
            remote_host: remote_host.into(),
            remote_port,
            local_bind_host: "127.0.0.1".to_string(),
            local_bind_port: 0,
            host_key_policy: HostKeyPolicy::default(),
            connect_timeout: None,
            startup_timeout: None,
            server_alive_interval: 15,
            server_alive_count_max: 3,
            extra_args: Vec::new(),
        }
    }

    pub fn with_public_key(mut self, private_key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        self.auth_method = SshAuthMethod::PublicKey {
            private_key_path: private_key_path.into(),
            passphrase,
        };
        self
    }

    /// Set the local bind port (0 for auto-assign)
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_bind_port = port;
        self
    }

    /// Build the SSH URL (user@host)
    pub fn ssh_url(&self) -> String {
        if self.ssh_user.is_empty() {
            self.ssh_host.clone()
        } else {
            format!("{}@{}", self.ssh_user, self.ssh_host)
        }
    }

    /// `-L` argument: bind_host:local_port:remote_host:remote_port
    pub fn forward_spec(&self, local_port: u16) -> String {
        format!(
            "{}:{}:{}:{}",
            self.local_bind_host, local_port, self.remote_host, self.remote_port
        )
    }
}

//! Opening SSH sessions for connection descriptors.
//!
//! `TunnelEstablisher` is the seam between the cache and the SSH provider:
//! the cache only knows how to ask for a session, `SshEstablisher` knows how
//! to turn a descriptor into an `ssh -L` child process.

use crate::config::TunnelConfig;
use crate::descriptor::ConnectionDescriptor;
use crate::error::TunnelError;
use crate::ssh::{SshTunnel, SshTunnelConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// The live part of a session: whatever keeps the forward open.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn is_alive(&self) -> bool;

    /// Stop forwarding. Must be safe to call more than once.
    async fn shutdown(&self);
}

#[async_trait]
impl SessionHandle for SshTunnel {
    async fn is_alive(&self) -> bool {
        SshTunnel::is_alive(self).await
    }

    async fn shutdown(&self) {
        SshTunnel::shutdown(self).await
    }
}

/// An established SSH session with a local port forward.
pub struct TunnelSession {
    id: Uuid,
    local_host: String,
    local_port: u16,
    established_at: DateTime<Utc>,
    handle: Box<dyn SessionHandle>,
}

impl TunnelSession {
    pub fn new(
        local_host: impl Into<String>,
        local_port: u16,
        handle: impl SessionHandle + 'static,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_host: local_host.into(),
            local_port,
            established_at: Utc::now(),
            handle: Box::new(handle),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Host clients connect to instead of the database host
    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    pub async fn is_alive(&self) -> bool {
        self.handle.is_alive().await
    }

    pub async fn shutdown(&self) {
        self.handle.shutdown().await
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr())
            .field("established_at", &self.established_at)
            .finish()
    }
}

/// Opens a session for a descriptor.
#[async_trait]
pub trait TunnelEstablisher: Send + Sync {
    async fn establish(&self, descriptor: &ConnectionDescriptor)
    -> Result<TunnelSession, TunnelError>;
}

/// Establishes sessions by running the system ssh binary.
#[derive(Debug, Clone, Default)]
pub struct SshEstablisher {
    config: TunnelConfig,
}

impl SshEstablisher {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Translate a descriptor into ssh invocation settings.
    pub fn tunnel_config(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<SshTunnelConfig, TunnelError> {
        let remote_port = descriptor.remote_port().ok_or_else(|| {
            TunnelError::malformed(
                &descriptor.original_target().connection_string(),
                "no database port could be resolved",
            )
        })?;

        let mut config = SshTunnelConfig::new(
            descriptor.ssh_host(),
            descriptor.ssh_port(),
            descriptor.ssh_user(),
            descriptor.remote_host(),
            remote_port,
        );
        config.program = self.config.ssh_program.clone();
        config.local_bind_host = self.config.local_bind_host.clone();
        config.host_key_policy = self.config.host_key_policy;
        config.connect_timeout = self.config.connect_timeout();
        config.startup_timeout = self.config.startup_timeout();
        config.server_alive_interval = self.config.server_alive_interval_secs;
        config.server_alive_count_max = self.config.server_alive_count_max;
        config.extra_args = self.config.extra_args.clone();

        match descriptor.private_key_path() {
            Some(path) if Path::new(path).exists() => Ok(config.with_public_key(
                path,
                descriptor.passphrase().map(str::to_string),
            )),
            Some(path) => {
                tracing::warn!(
                    "Private key {} not found, falling back to ssh-agent for {}",
                    path,
                    descriptor.ssh_target()
                );
                Ok(config)
            }
            None => Ok(config),
        }
    }
}

#[async_trait]
impl TunnelEstablisher for SshEstablisher {
    async fn establish(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<TunnelSession, TunnelError> {
        let config = self.tunnel_config(descriptor)?;
        let local_host = config.local_bind_host.clone();

        let tunnel = SshTunnel::start(config)
            .await
            .map_err(|e| TunnelError::ssh(descriptor.ssh_target(), e))?;

        Ok(TunnelSession::new(local_host, tunnel.local_port(), tunnel))
    }
}

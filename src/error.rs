//! Error types surfaced by the tunnel router.

use crate::parser::redact_secrets;
use std::sync::Arc;

/// Boxed cause returned by database clients.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared cause carried by the error variants, so one failure can be handed
/// to every caller waiting on the same tunnel.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Every failure the router can report.
///
/// The variants keep "could not parse or route" apart from "could not open the
/// tunnel" and from "the database rejected the connection". URLs carried by
/// the variants have passwords and `sshPassphrase` values masked.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TunnelError {
    /// The connection string does not carry the `ssh` tunnel marker
    #[error("Not an ssh tunnel connection string: {url}")]
    NotTunneled { url: String },

    /// The connection string could not be parsed into a structured target
    #[error("Malformed connection string {url}: {reason}")]
    MalformedTarget { url: String, reason: String },

    /// No registered client accepts the de-tunneled connection string
    #[error("No suitable database client found for URL: {url}")]
    NoUnderlyingClient { url: String },

    /// The SSH session or the port forward could not be set up
    #[error("Failed to establish SSH tunnel via {ssh_target}")]
    SshEstablish {
        ssh_target: String,
        #[source]
        source: SharedError,
    },

    /// The underlying client failed to connect through a working tunnel
    #[error("Database client {client} failed to connect to {url}")]
    DelegatedConnect {
        client: String,
        url: String,
        #[source]
        source: SharedError,
    },
}

impl TunnelError {
    pub(crate) fn not_tunneled(url: &str) -> Self {
        TunnelError::NotTunneled {
            url: redact_secrets(url),
        }
    }

    pub(crate) fn malformed(url: &str, reason: impl Into<String>) -> Self {
        TunnelError::MalformedTarget {
            url: redact_secrets(url),
            reason: reason.into(),
        }
    }

    pub(crate) fn no_client(url: &str) -> Self {
        TunnelError::NoUnderlyingClient {
            url: redact_secrets(url),
        }
    }

    /// Wrap an `anyhow` chain coming out of the ssh layer.
    pub(crate) fn ssh(ssh_target: impl Into<String>, error: anyhow::Error) -> Self {
        let source: BoxError = error.into();
        TunnelError::SshEstablish {
            ssh_target: ssh_target.into(),
            source: Arc::from(source),
        }
    }

    pub(crate) fn delegated(client: &str, url: &str, source: BoxError) -> Self {
        TunnelError::DelegatedConnect {
            client: client.to_string(),
            url: redact_secrets(url),
            source: Arc::from(source),
        }
    }

    /// True for failures that happened before any tunnel was touched.
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            TunnelError::NotTunneled { .. }
                | TunnelError::MalformedTarget { .. }
                | TunnelError::NoUnderlyingClient { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_ssh_error_keeps_cause() {
        let err = TunnelError::ssh(
            "deploy@bastion:22",
            anyhow::anyhow!("Permission denied (publickey)"),
        );
        assert!(err.to_string().contains("deploy@bastion:22"));
        let source = err.source().expect("source should be preserved");
        assert!(source.to_string().contains("Permission denied"));
        assert!(!err.is_routing_error());
    }

    #[test]
    fn test_cause_is_not_repeated_in_message() {
        let err = TunnelError::ssh("deploy@bastion:22", anyhow::anyhow!("Connection refused"));
        assert!(!err.to_string().contains("Connection refused"));

        let report = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(report.matches("Connection refused").count(), 1);
    }

    #[test]
    fn test_clone_shares_cause() {
        let err = TunnelError::delegated(
            "mysql",
            "mysql://127.0.0.1:4000/app",
            "access denied".into(),
        );
        let copy = err.clone();
        assert_eq!(copy.source().map(|s| s.to_string()), Some("access denied".to_string()));
    }

    #[test]
    fn test_urls_are_redacted() {
        let err = TunnelError::malformed(
            "jdbc:ssh:mysql://root:hunter2@db/app?sshPassphrase=TOPSECRET",
            "bad",
        );
        let rendered = err.to_string();
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("TOPSECRET"));
    }

    #[test]
    fn test_routing_errors() {
        assert!(TunnelError::malformed("jdbc:ssh:mysql://", "missing host").is_routing_error());
        assert!(TunnelError::no_client("jdbc:foo://x").is_routing_error());
        assert!(TunnelError::not_tunneled("postgres://x").is_routing_error());
    }
}

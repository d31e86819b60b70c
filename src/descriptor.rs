//! Parsed tunnel descriptor. Doubles as the tunnel cache key.

use crate::error::TunnelError;
use crate::parser::redact_secrets;
use std::fmt;
use url::Url;

/// The pre-tunnel database target.
///
/// `prefix` holds the protocol segments that precede the underlying scheme
/// (for `jdbc:ssh:mysql://...` that is `jdbc:`), `url` the structured
/// `scheme://[userinfo@]host[:port]/path[?query][#fragment]` part.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OriginalTarget {
    prefix: String,
    url: Url,
}

impl OriginalTarget {
    pub(crate) fn new(prefix: impl Into<String>, url: Url) -> Self {
        Self {
            prefix: prefix.into(),
            url,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// The de-tunneled connection string, as handed to the underlying client.
    pub fn connection_string(&self) -> String {
        format!("{}{}", self.prefix, self.url)
    }

    /// Rebuild the connection string with only host and port replaced.
    ///
    /// Scheme, user info, path, query and fragment are carried over as-is.
    pub fn rewrite(&self, host: &str, port: u16) -> Result<String, TunnelError> {
        let url = self.rewritten_url(host, port)?;
        Ok(format!("{}{}", self.prefix, url))
    }

    /// `rewrite` with secrets masked, for logs and error messages.
    pub fn rewrite_redacted(&self, host: &str, port: u16) -> Result<String, TunnelError> {
        self.rewrite(host, port).map(|rewritten| redact_secrets(&rewritten))
    }

    fn rewritten_url(&self, host: &str, port: u16) -> Result<Url, TunnelError> {
        let mut url = self.url.clone();
        url.set_host(Some(host)).map_err(|e| {
            TunnelError::malformed(&self.connection_string(), format!("cannot set host: {}", e))
        })?;
        url.set_port(Some(port)).map_err(|_| {
            TunnelError::malformed(&self.connection_string(), "target URL cannot carry a port")
        })?;
        Ok(url)
    }
}

impl fmt::Debug for OriginalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OriginalTarget")
            .field(&redact_secrets(&self.connection_string()))
            .finish()
    }
}

/// Remote database endpoint plus the SSH parameters used to reach it.
///
/// Built once per connect request and never mutated afterwards. Equality and
/// hashing cover every field, including the resolved client id and the full
/// original target, so equal descriptors always share one tunnel.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor {
    remote_host: String,
    remote_port: Option<u16>,
    ssh_host: String,
    ssh_port: u16,
    ssh_user: String,
    private_key_path: Option<String>,
    passphrase: Option<String>,
    original_target: OriginalTarget,
    client_id: String,
}

impl ConnectionDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        remote_host: String,
        remote_port: Option<u16>,
        ssh_host: String,
        ssh_port: u16,
        ssh_user: String,
        private_key_path: Option<String>,
        passphrase: Option<String>,
        original_target: OriginalTarget,
        client_id: String,
    ) -> Self {
        Self {
            remote_host,
            remote_port,
            ssh_host,
            ssh_port,
            ssh_user,
            private_key_path,
            passphrase,
            original_target,
            client_id,
        }
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// `None` when neither the URL, the client nor the scheme supplied a port.
    pub fn remote_port(&self) -> Option<u16> {
        self.remote_port
    }

    pub fn ssh_host(&self) -> &str {
        &self.ssh_host
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn ssh_user(&self) -> &str {
        &self.ssh_user
    }

    pub fn private_key_path(&self) -> Option<&str> {
        self.private_key_path.as_deref()
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }

    pub fn original_target(&self) -> &OriginalTarget {
        &self.original_target
    }

    /// Identifier of the database client selected for this target.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// `user@host:port` of the bastion, for logs and error messages.
    pub fn ssh_target(&self) -> String {
        if self.ssh_user.is_empty() {
            format!("{}:{}", self.ssh_host, self.ssh_port)
        } else {
            format!("{}@{}:{}", self.ssh_user, self.ssh_host, self.ssh_port)
        }
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .field("private_key_path", &self.private_key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("original_target", &self.original_target)
            .field("client_id", &self.client_id)
            .finish()
    }
}

//! Turns a tunnel-annotated connection string into a `ConnectionDescriptor`.
//!
//! Accepted shape: `[<prefix>:]ssh:<scheme>://[userinfo@]host[:port]/path[?query]`.
//! The `ssh` protocol segment is the tunnel marker; SSH settings travel in the
//! query string as `sshHost`, `sshPort`, `sshUser`, `sshKey` and `sshPassphrase`.

use crate::client::{ClientRegistry, ConnectOptions, HOST_PROPERTY_KEY, PORT_PROPERTY_KEY};
use crate::descriptor::{ConnectionDescriptor, OriginalTarget};
use crate::error::TunnelError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// Protocol segment that activates tunneling
pub const TUNNEL_MARKER: &str = "ssh";

/// SSH port used when `sshPort` is absent
pub const DEFAULT_SSH_PORT: u16 = 22;

const SSH_HOST_PARAM: &str = "sshHost";
const SSH_PORT_PARAM: &str = "sshPort";
const SSH_USER_PARAM: &str = "sshUser";
const SSH_KEY_PARAM: &str = "sshKey";
const SSH_PASSPHRASE_PARAM: &str = "sshPassphrase";

/// Stand-in for masked secrets
const REDACTED: &str = "***";

/// Process-level values used as fallback defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    user_name: String,
    home_dir: Option<PathBuf>,
}

impl Environment {
    pub fn new(user_name: impl Into<String>, home_dir: Option<PathBuf>) -> Self {
        Self {
            user_name: user_name.into(),
            home_dir,
        }
    }

    /// Read the current OS user and home directory.
    ///
    /// The user comes from `USER` / `USERNAME` / `LOGNAME`, then the system
    /// account database. It stays empty when neither knows it, which leaves
    /// the choice to ssh.
    pub fn from_process() -> Self {
        let user_name = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .or_else(|_| std::env::var("LOGNAME"))
            .or_else(|_| whoami::fallible::username())
            .unwrap_or_else(|e| {
                tracing::warn!("Could not determine the current user: {}", e);
                String::new()
            });
        Self {
            user_name,
            home_dir: dirs::home_dir(),
        }
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// `<home>/.ssh/id_rsa`, if a home directory is known.
    pub fn default_private_key(&self) -> Option<String> {
        self.home_dir.as_ref().map(|home| {
            home.join(".ssh")
                .join("id_rsa")
                .to_string_lossy()
                .into_owned()
        })
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::from_process()
    }
}

/// Connection string split at the tunnel marker.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SplitTarget {
    /// Protocol segments left of the underlying scheme, with trailing `:`
    prefix: String,
    /// `<scheme>://...` part
    target: String,
}

impl SplitTarget {
    fn original(&self) -> String {
        format!("{}{}", self.prefix, self.target)
    }
}

fn protocol_segments(raw: &str) -> (Vec<&str>, &str) {
    match raw.find("://") {
        Some(idx) => (raw[..idx].split(':').collect(), &raw[idx..]),
        None => (raw.split(':').collect(), ""),
    }
}

/// Whether the protocol portion of `raw` carries the tunnel marker.
///
/// A lone `ssh://host` is an SSH URL, not a tunneled database target, so the
/// marker must share the protocol with at least one other segment.
pub fn is_tunnel_url(raw: &str) -> bool {
    let (segments, _) = protocol_segments(raw);
    segments.len() >= 2
        && segments
            .iter()
            .any(|s| s.eq_ignore_ascii_case(TUNNEL_MARKER))
}

/// Remove the tunnel marker from the protocol portion only.
///
/// Returns `None` when `raw` is not a tunnel URL.
pub fn strip_tunnel_marker(raw: &str) -> Option<String> {
    split_tunnel_marker(raw).map(|split| split.original())
}

fn split_tunnel_marker(raw: &str) -> Option<SplitTarget> {
    if !is_tunnel_url(raw) {
        return None;
    }
    let (mut segments, rest) = protocol_segments(raw);
    let marker = segments
        .iter()
        .position(|s| s.eq_ignore_ascii_case(TUNNEL_MARKER))?;
    segments.remove(marker);

    let scheme = segments.pop().unwrap_or_default();
    let prefix: String = segments.iter().map(|s| format!("{}:", s)).collect();
    Some(SplitTarget {
        prefix,
        target: format!("{}{}", scheme, rest),
    })
}

/// Split a query string into a flat map.
///
/// Splits on `&`, then on the first `=`. A parameter without `=` maps to an
/// empty string; on duplicate keys the last occurrence wins. Values are taken
/// verbatim, without percent-decoding.
pub fn parse_query_params(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };
    for param in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        params.insert(key.to_string(), value.to_string());
    }
    params
}

/// Mask the URL password and any `sshPassphrase` query value in `raw`.
///
/// Works on the string as given, so protocol prefixes such as `jdbc:` and the
/// tunnel marker are kept.
pub fn redact_secrets(raw: &str) -> String {
    let (before_fragment, fragment) = raw.split_at(raw.find('#').unwrap_or(raw.len()));
    let (head, query) = match before_fragment.split_once('?') {
        Some((head, query)) => (head, Some(query)),
        None => (before_fragment, None),
    };

    let mut redacted = redact_password(head);
    if let Some(query) = query {
        let params: Vec<String> = query
            .split('&')
            .map(|param| match param.split_once('=') {
                Some((key, value)) if key == SSH_PASSPHRASE_PARAM && !value.is_empty() => {
                    format!("{}={}", key, REDACTED)
                }
                _ => param.to_string(),
            })
            .collect();
        redacted.push('?');
        redacted.push_str(&params.join("&"));
    }
    redacted.push_str(fragment);
    redacted
}

/// Mask the password of the `user:password@` part, if any.
fn redact_password(head: &str) -> String {
    let Some(start) = head.find("://").map(|i| i + 3) else {
        return head.to_string();
    };
    let end = head[start..].find('/').map_or(head.len(), |i| start + i);
    let authority = &head[start..end];

    let Some(at) = authority.rfind('@') else {
        return head.to_string();
    };
    match authority[..at].split_once(':') {
        Some((user, _)) => format!(
            "{}{}:{}{}",
            &head[..start],
            user,
            REDACTED,
            &head[start + at..]
        ),
        None => head.to_string(),
    }
}

/// Well-known port for a database scheme.
pub fn well_known_port(scheme: &str) -> Option<u16> {
    match scheme.to_ascii_lowercase().as_str() {
        "mysql" | "mariadb" => Some(3306),
        "postgres" | "postgresql" => Some(5432),
        "sqlserver" | "mssql" => Some(1433),
        "oracle" => Some(1521),
        _ => None,
    }
}

fn property<'a>(properties: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    properties
        .iter()
        .find(|(key, value)| key.eq_ignore_ascii_case(name) && !value.is_empty())
        .map(|(_, value)| value.as_str())
}

/// A query value counts as set only when non-empty.
fn non_empty(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params.get(key).filter(|v| !v.is_empty()).cloned()
}

/// Parses connection strings against an injected client registry.
pub struct DescriptorParser<C> {
    registry: Arc<ClientRegistry<C>>,
    environment: Environment,
}

impl<C: Send + 'static> DescriptorParser<C> {
    pub fn new(registry: Arc<ClientRegistry<C>>) -> Self {
        Self::with_environment(registry, Environment::from_process())
    }

    pub fn with_environment(registry: Arc<ClientRegistry<C>>, environment: Environment) -> Self {
        Self {
            registry,
            environment,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry<C>> {
        &self.registry
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Build the descriptor for `raw`.
    ///
    /// Remote port precedence: explicit URL port, then the client's declared
    /// default, then the scheme's well-known port, else `None`.
    pub fn parse(
        &self,
        raw: &str,
        options: &ConnectOptions,
    ) -> Result<ConnectionDescriptor, TunnelError> {
        let split = split_tunnel_marker(raw).ok_or_else(|| TunnelError::not_tunneled(raw))?;
        let original = split.original();

        let client = self
            .registry
            .resolve(&original)
            .ok_or_else(|| TunnelError::no_client(&original))?;

        if !split.target.contains("://") {
            return Err(TunnelError::malformed(raw, "expected <scheme>://host"));
        }
        let url = Url::parse(&split.target)
            .map_err(|e| TunnelError::malformed(raw, e.to_string()))?;

        let defaults = client.default_connection_properties(&original, options);

        let remote_host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .or_else(|| property(&defaults, HOST_PROPERTY_KEY).map(str::to_string))
            .ok_or_else(|| TunnelError::malformed(raw, "no database host"))?;

        let remote_port = url
            .port()
            .or_else(|| property(&defaults, PORT_PROPERTY_KEY).and_then(|p| p.parse().ok()))
            .or_else(|| well_known_port(url.scheme()));

        let params = parse_query_params(url.query());

        let ssh_host = non_empty(&params, SSH_HOST_PARAM).unwrap_or_else(|| remote_host.clone());
        let ssh_port = match non_empty(&params, SSH_PORT_PARAM) {
            Some(port) => port.parse::<u16>().map_err(|_| {
                TunnelError::malformed(raw, format!("invalid {}: {}", SSH_PORT_PARAM, port))
            })?,
            None => DEFAULT_SSH_PORT,
        };
        let ssh_user = non_empty(&params, SSH_USER_PARAM)
            .unwrap_or_else(|| self.environment.user_name().to_string());
        // An explicit empty `sshKey=` opts out of key auth
        let private_key_path = match params.get(SSH_KEY_PARAM) {
            Some(key) if key.is_empty() => None,
            Some(key) => Some(key.clone()),
            None => self.environment.default_private_key(),
        };
        let passphrase = non_empty(&params, SSH_PASSPHRASE_PARAM);

        let descriptor = ConnectionDescriptor::new(
            remote_host,
            remote_port,
            ssh_host,
            ssh_port,
            ssh_user,
            private_key_path,
            passphrase,
            OriginalTarget::new(split.prefix, url),
            client.id().to_string(),
        );
        tracing::debug!(?descriptor, "Parsed tunnel descriptor");
        Ok(descriptor)
    }
}

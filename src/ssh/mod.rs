//! SSH session provider.
//!
//! This module provides:
//! - `SshTunnel` - local port forward through the system ssh binary
//! - `AskpassProxy` - secure passphrase delivery via Unix socket
//! - `SshTunnelConfig` / `HostKeyPolicy` - how ssh is invoked

mod askpass;
mod tunnel;
mod types;

#[cfg(unix)]
pub use askpass::AskpassProxy;
pub use askpass::handle_askpass_mode;
pub use tunnel::SshTunnel;
pub use types::{HostKeyPolicy, SshAuthMethod, SshTunnelConfig};

//! Transparent SSH tunneling for database connection strings.
//!
//! A connection string such as `jdbc:ssh:mysql://db.internal/app?sshHost=bastion`
//! is parsed into a [`ConnectionDescriptor`], an `ssh -L` forward to the database
//! is opened (once per distinct descriptor) and the underlying client receives
//! the same connection string pointed at the local end of the forward.

pub mod cache;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod establisher;
pub mod parser;
pub mod router;
pub mod ssh;

pub use cache::{ReusePolicy, TunnelCache, TunnelEvent, TunnelState};
pub use client::{ClientRegistry, ConnectOptions, DatabaseClient, SqlxClient};
pub use config::TunnelConfig;
pub use descriptor::{ConnectionDescriptor, OriginalTarget};
pub use error::TunnelError;
pub use establisher::{SessionHandle, SshEstablisher, TunnelEstablisher, TunnelSession};
pub use parser::{DescriptorParser, Environment};
pub use router::TunnelRouter;
pub use ssh::{HostKeyPolicy, handle_askpass_mode};

//! Underlying database clients the router delegates to.
//!
//! This module provides:
//! - `DatabaseClient` - what a downstream client must expose to be tunneled
//! - `ClientRegistry` - explicit, injected collection of clients
//! - `SqlxClient` - adapter over `sqlx::AnyConnection`

mod sqlx_any;

pub use sqlx_any::SqlxClient;

use crate::error::BoxError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Options bag passed alongside a connection string.
pub type ConnectOptions = HashMap<String, String>;

/// Property name under which a client reports its default host
pub const HOST_PROPERTY_KEY: &str = "HOST";

/// Property name under which a client reports its default port
pub const PORT_PROPERTY_KEY: &str = "PORT";

/// A downstream database client that performs the actual protocol exchange.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Connection handle returned by `connect`.
    type Connection: Send;

    /// Stable identifier. Part of the tunnel cache key, so it must not change
    /// between calls.
    fn id(&self) -> &str;

    /// Whether this client understands the (de-tunneled) connection string.
    fn accepts_url(&self, url: &str) -> bool;

    /// Connection defaults the client would apply to `url`.
    ///
    /// Entries named `HOST` / `PORT` (case-insensitive) are used when the URL
    /// itself carries no host or port.
    fn default_connection_properties(
        &self,
        _url: &str,
        _options: &ConnectOptions,
    ) -> HashMap<String, String> {
        HashMap::new()
    }

    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<Self::Connection, BoxError>;
}

/// Ordered set of clients; the first one accepting a URL wins.
pub struct ClientRegistry<C> {
    clients: Vec<Arc<dyn DatabaseClient<Connection = C>>>,
}

impl<C: Send + 'static> ClientRegistry<C> {
    pub fn new() -> Self {
        Self {
            clients: Vec::new(),
        }
    }

    /// Register a client. A client with the same id replaces the earlier one
    /// in place, keeping its position.
    pub fn register<D>(&mut self, client: D) -> &mut Self
    where
        D: DatabaseClient<Connection = C> + 'static,
    {
        let client: Arc<dyn DatabaseClient<Connection = C>> = Arc::new(client);
        match self.clients.iter().position(|c| c.id() == client.id()) {
            Some(index) => {
                tracing::debug!("Replacing database client {}", client.id());
                self.clients[index] = client;
            }
            None => {
                tracing::debug!("Registered database client {}", client.id());
                self.clients.push(client);
            }
        }
        self
    }

    /// Builder-style `register`.
    pub fn with_client<D>(mut self, client: D) -> Self
    where
        D: DatabaseClient<Connection = C> + 'static,
    {
        self.register(client);
        self
    }

    /// First registered client accepting `url`.
    pub fn resolve(&self, url: &str) -> Option<Arc<dyn DatabaseClient<Connection = C>>> {
        self.clients.iter().find(|c| c.accepts_url(url)).cloned()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn DatabaseClient<Connection = C>>> {
        self.clients.iter().find(|c| c.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl<C: Send + 'static> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

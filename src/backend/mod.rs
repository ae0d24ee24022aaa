//! Capability interfaces every concrete backend implements.
//!
//! Sessions and servers only ever see `Arc<dyn …>` handles, so a local mailbox store, a relay
//! resolver or an external credential store can be wired in without touching them.
//! Implementations are shared by every live session and must be safe for concurrent use.

pub mod local;
pub mod resolver;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::protocol::Message;

pub use local::{LocalBackend, Mailstore, StoredMessage};
pub use resolver::DomainResolver;

/// An authenticated principal. Once a session holds one it never changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.username)
    }
}

/// Where a recipient address is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Relay,
    /// The address has no usable domain.
    Unroutable,
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// Worth retrying later; maps to a 4xx reply.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// Permanent refusal; maps to a 5xx reply.
    #[error("rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

pub trait AuthService: Send + Sync {
    /// `Ok(None)` means the credentials were checked and refused.
    fn authenticate(&self, mechanism: &str, args: &[String]) -> Result<Option<Identity>, BackendError>;

    /// Supported SASL mechanisms, in advertisement order.
    fn mechanisms(&self) -> Vec<String>;
}

pub trait DeliveryService: Send + Sync {
    /// Takes ownership of an accepted message and returns its id.
    fn deliver(&self, message: &Message) -> Result<String, BackendError>;

    fn will_deliver(&self, to: &str, from: &str, identity: Option<&Identity>) -> bool;

    fn max_recipients(&self, identity: Option<&Identity>) -> usize;
}

pub trait ResolverService: Send + Sync {
    fn resolve(&self, address: &str) -> Route;
}

/// The set of backends a listener is wired to.
#[derive(Clone)]
pub struct Backends {
    pub auth: Arc<dyn AuthService>,
    pub delivery: Arc<dyn DeliveryService>,
}

impl Backends {
    /// Uses one local backend for both authentication and delivery.
    pub fn local(backend: Arc<LocalBackend>) -> Self {
        Self {
            auth: backend.clone(),
            delivery: backend,
        }
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

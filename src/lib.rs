//! An SMTP intake and submission server.
//!
//! Each configured listener is a [`server::Server`] with its own [`config::PolicySet`].
//! Accepted connections become [`session::Session`]s that drive the
//! [`protocol::Protocol`] state machine and consult the [`backend`] services for
//! authentication, recipient policy and delivery.

pub mod backend;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tls;

#[cfg(unix)]
pub mod daemon;

pub use config::{Config, PolicySet, ServerConfig};
pub use server::Server;

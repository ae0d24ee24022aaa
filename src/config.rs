//! Listener definitions, policy sets and backend settings.
//!
//! A [`Config`] is built once at startup, either from [`Config::default`] or from a TOML
//! file, and then shared read-only behind an `Arc`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RFC 5321 §4.5.3.2.7 server timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Root that relative TLS paths are resolved against.
    pub rel_path: PathBuf,
    pub servers: Vec<ServerConfig>,
    pub backend: BackendConfig,
}

const DEFAULT_HOSTNAME: &str = "mail.example";

impl Default for Config {
    /// Intake and submission for `mail.example`, which is also the only local domain.
    fn default() -> Self {
        Self {
            rel_path: PathBuf::from("."),
            servers: vec![
                ServerConfig::new("0.0.0.0:25", DEFAULT_HOSTNAME, PolicySet::intake()),
                ServerConfig::new("0.0.0.0:587", DEFAULT_HOSTNAME, PolicySet::submission()),
            ],
            backend: BackendConfig {
                local_domains: vec![DEFAULT_HOSTNAME.to_string()],
                ..BackendConfig::default()
            },
        }
    }
}

impl Config {
    /// Loads and validates a TOML file. A relative `rel_path` is taken relative to the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content)?;

        if config.rel_path.is_relative() {
            if let Some(parent) = path.parent() {
                config.rel_path = parent.join(&config.rel_path);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reports every problem found, not only the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.servers.is_empty() {
            errors.push("at least one server must be configured".to_string());
        }

        for server in &self.servers {
            if server.bind_addr.parse::<SocketAddr>().is_err() {
                errors.push(format!("bind_addr {:?} is not a socket address", server.bind_addr));
            }
            if server.hostname.trim().is_empty() {
                errors.push(format!("server {} has an empty hostname", server.bind_addr));
            }
            if server.policy_set.maximum_connections == 0 {
                errors.push(format!("server {} allows no connections", server.bind_addr));
            }
            if server.policy_set.maximum_recipients == 0 {
                errors.push(format!("server {} allows no recipients", server.bind_addr));
            }
            if server.policy_set.maximum_message_size == 0 {
                errors.push(format!("server {} accepts no message body", server.bind_addr));
            }
            if server.idle_timeout == 0 {
                errors.push(format!("server {} has a zero idle timeout", server.bind_addr));
            }
            if let Some(tls) = &server.tls {
                if tls.cert_file.as_os_str().is_empty() || tls.key_file.as_os_str().is_empty() {
                    errors.push(format!("server {} has incomplete TLS paths", server.bind_addr));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Settings that are valid but leave a listener unable to do its job.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for server in &self.servers {
            let policy = &server.policy_set;
            if policy.require_local_delivery && self.backend.local_domains.is_empty() {
                warnings.push(format!(
                    "server {} only delivers locally but no local_domains are configured, every recipient will be refused",
                    server.bind_addr
                ));
            }
            if policy.require_authentication && self.backend.users.is_empty() {
                warnings.push(format!(
                    "server {} requires authentication but no users are configured, no client can send mail",
                    server.bind_addr
                ));
            }
        }

        warnings
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        self.rel_path.join(path)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub hostname: String,
    #[serde(default)]
    pub policy_set: PolicySet,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Seconds a client may stay silent before the session is closed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}

impl ServerConfig {
    pub fn new(bind_addr: impl Into<String>, hostname: impl Into<String>, policy_set: PolicySet) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            hostname: hostname.into(),
            policy_set,
            tls: None,
            idle_timeout: default_idle_timeout(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

/// Per-listener rules. Immutable once a server is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicySet {
    pub require_authentication: bool,
    pub require_local_delivery: bool,
    pub maximum_connections: usize,
    pub maximum_recipients: usize,
    /// Bytes of message body accepted per transaction.
    pub maximum_message_size: usize,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            require_authentication: false,
            require_local_delivery: false,
            maximum_connections: 100,
            maximum_recipients: 100,
            maximum_message_size: 10 * 1024 * 1024,
        }
    }
}

impl PolicySet {
    /// MTA intake, e.g. port 25: anonymous, local recipients only.
    pub fn intake() -> Self {
        Self {
            require_local_delivery: true,
            ..Self::default()
        }
    }

    /// Message submission, e.g. port 587: AUTH before any mail transaction.
    pub fn submission() -> Self {
        Self {
            require_authentication: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Handshake before the greeting instead of offering STARTTLS.
    #[serde(default)]
    pub implicit: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub local_domains: Vec<String>,
    /// Accepted local mailboxes. Empty accepts any address in a local domain.
    pub mailboxes: Vec<String>,
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

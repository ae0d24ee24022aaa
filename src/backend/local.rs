//! In-process backend: credentials from the configuration and mailboxes kept in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use super::{AuthService, BackendError, DeliveryService, DomainResolver, Identity, ResolverService, Route};
use crate::config::{BackendConfig, PolicySet};
use crate::protocol::Message;

/// A message as it was accepted, with the id handed back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub message: Message,
}

#[derive(Debug, Default)]
struct Store {
    mailboxes: HashMap<String, Vec<StoredMessage>>,
    outbound: Vec<StoredMessage>,
}

/// Mailboxes shared by every listener of the process.
#[derive(Debug, Default)]
pub struct Mailstore {
    inner: Mutex<Store>,
}

impl Mailstore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages delivered to `mailbox`, oldest first.
    pub fn messages(&self, mailbox: &str) -> Vec<StoredMessage> {
        self.lock()
            .mailboxes
            .get(&mailbox.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Messages accepted for at least one non-local recipient.
    pub fn outbound(&self) -> Vec<StoredMessage> {
        self.lock().outbound.clone()
    }
}

pub struct LocalBackend {
    policy: PolicySet,
    resolver: Arc<dyn ResolverService>,
    mailboxes: Vec<String>,
    users: HashMap<String, String>,
    store: Arc<Mailstore>,
}

impl LocalBackend {
    pub fn new(policy: PolicySet, config: &BackendConfig, store: Arc<Mailstore>) -> Self {
        Self {
            policy,
            resolver: Arc::new(DomainResolver::new(&config.local_domains)),
            mailboxes: config
                .mailboxes
                .iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
            users: config
                .users
                .iter()
                .map(|u| (u.username.clone(), u.password.clone()))
                .collect(),
            store,
        }
    }

    pub fn store(&self) -> &Arc<Mailstore> {
        &self.store
    }

    fn is_known_mailbox(&self, address: &str) -> bool {
        self.mailboxes.is_empty() || self.mailboxes.iter().any(|m| m.eq_ignore_ascii_case(address))
    }

    fn check_password(&self, username: &str, password: &str) -> Option<Identity> {
        match self.users.get(username) {
            Some(expected) if expected == password => Some(Identity::new(username)),
            _ => None,
        }
    }
}

fn decode(argument: &str) -> Option<String> {
    base64::decode(argument.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Splits an RFC 4616 `authzid NUL authcid NUL passwd` message.
fn decode_plain(argument: &str) -> Option<(String, String)> {
    let decoded = decode(argument)?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next()?;
    let username = parts.next()?;
    let password = parts.next()?;
    if parts.next().is_some() || username.is_empty() {
        return None;
    }
    Some((username.to_string(), password.to_string()))
}

impl AuthService for LocalBackend {
    fn authenticate(&self, mechanism: &str, args: &[String]) -> Result<Option<Identity>, BackendError> {
        let credentials = match mechanism.to_ascii_uppercase().as_str() {
            "PLAIN" => match args {
                [response] => decode_plain(response),
                _ => None,
            },
            "LOGIN" => match args {
                [username, password] => decode(username).zip(decode(password)),
                _ => None,
            },
            other => {
                return Err(BackendError::Rejected(format!(
                    "unsupported mechanism {}",
                    other
                )))
            }
        };

        Ok(credentials.and_then(|(username, password)| self.check_password(&username, &password)))
    }

    fn mechanisms(&self) -> Vec<String> {
        vec!["PLAIN".to_string(), "LOGIN".to_string()]
    }
}

impl DeliveryService for LocalBackend {
    fn deliver(&self, message: &Message) -> Result<String, BackendError> {
        if message.to.is_empty() {
            return Err(BackendError::Rejected("message has no recipients".to_string()));
        }

        let stored = StoredMessage {
            id: Uuid::new_v4().to_string(),
            message: message.clone(),
        };

        let mut local = Vec::new();
        let mut relayed = false;
        for to in &message.to {
            match self.resolver.resolve(to) {
                Route::Local => local.push(to.to_ascii_lowercase()),
                Route::Relay => relayed = true,
                Route::Unroutable => {
                    return Err(BackendError::Rejected(format!("no route to {}", to)));
                }
            }
        }

        let mut store = self.store.lock();
        for mailbox in local {
            store.mailboxes.entry(mailbox).or_default().push(stored.clone());
        }
        if relayed {
            store.outbound.push(stored.clone());
        }

        Ok(stored.id)
    }

    fn will_deliver(&self, to: &str, _from: &str, identity: Option<&Identity>) -> bool {
        match self.resolver.resolve(to) {
            Route::Local => self.is_known_mailbox(to),
            Route::Relay => !self.policy.require_local_delivery && identity.is_some(),
            Route::Unroutable => false,
        }
    }

    fn max_recipients(&self, _identity: Option<&Identity>) -> usize {
        self.policy.maximum_recipients
    }
}

use super::{ResolverService, Route};

/// Classifies addresses by domain: the configured domains are local, everything else relays.
#[derive(Debug, Clone, Default)]
pub struct DomainResolver {
    local_domains: Vec<String>,
}

impl DomainResolver {
    pub fn new<I, S>(local_domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            local_domains: local_domains
                .into_iter()
                .map(|d| d.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl ResolverService for DomainResolver {
    fn resolve(&self, address: &str) -> Route {
        let Some((local, domain)) = address.rsplit_once('@') else {
            return Route::Unroutable;
        };
        if local.is_empty() || domain.is_empty() {
            return Route::Unroutable;
        }

        let domain = domain.to_ascii_lowercase();
        if self.local_domains.iter().any(|d| *d == domain) {
            Route::Local
        } else {
            Route::Relay
        }
    }
}

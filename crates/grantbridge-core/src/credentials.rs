//! Credential lookup for credential-gated sources.
//!
//! A [`SourceDescriptor`] lists lookup identifiers in priority order (for
//! example `CANDID_GRANTS_KEYS` then `CANDID_KEY`). The [`CredentialResolver`]
//! tries them against a [`CredentialStore`] and stops at the first hit.

use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, RwLock};

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::registry::SourceDescriptor;

/// Credential value. Zeroed on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw value. Only transports should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl Display for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(crate::sanitizer::REDACTED)
    }
}

/// Named credential lookup.
pub trait CredentialStore: Send + Sync + Debug {
    /// Returns the credential stored under `name`, if any. Blank values count as absent.
    fn lookup(&self, name: &str) -> Option<Secret>;
}

/// Reads credentials from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn lookup(&self, name: &str) -> Option<Secret> {
        std::env::var(name)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(Secret::new)
    }
}

/// In-memory credential store, used for explicit assignment and tests.
#[derive(Default)]
pub struct MapCredentialStore {
    values: RwLock<HashMap<String, Secret>>,
}

impl MapCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, Secret::new(value));
        self
    }

    pub fn insert(&self, name: impl Into<String>, value: Secret) {
        self.values
            .write()
            .expect("credential map lock is not poisoned")
            .insert(name.into(), value);
    }
}

impl Debug for MapCredentialStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let values = self
            .values
            .read()
            .expect("credential map lock is not poisoned");
        let mut names = values.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("MapCredentialStore")
            .field("names", &names)
            .finish()
    }
}

impl CredentialStore for MapCredentialStore {
    fn lookup(&self, name: &str) -> Option<Secret> {
        self.values
            .read()
            .expect("credential map lock is not poisoned")
            .get(name)
            .filter(|value| !value.expose().trim().is_empty())
            .cloned()
    }
}

/// Consults several stores in order, e.g. explicit assignments before the environment.
#[derive(Debug, Default)]
pub struct LayeredCredentialStore {
    layers: Vec<Arc<dyn CredentialStore>>,
}

impl LayeredCredentialStore {
    pub fn new(layers: Vec<Arc<dyn CredentialStore>>) -> Self {
        Self { layers }
    }
}

impl CredentialStore for LayeredCredentialStore {
    fn lookup(&self, name: &str) -> Option<Secret> {
        self.layers.iter().find_map(|layer| layer.lookup(name))
    }
}

/// Result of resolving one source's credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialResolution {
    /// The source does not need a credential.
    NotRequired,
    /// Resolved through the named lookup.
    Resolved { via: String, secret: Secret },
    /// Every lookup was tried and none produced a value.
    Missing { tried: Vec<String> },
}

impl CredentialResolution {
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Missing { .. })
    }

    pub fn secret(&self) -> Option<&Secret> {
        match self {
            Self::Resolved { secret, .. } => Some(secret),
            _ => None,
        }
    }

    /// Name of the lookup that produced the credential. Safe to log.
    pub fn lookup_name(&self) -> Option<&str> {
        match self {
            Self::Resolved { via, .. } => Some(via),
            _ => None,
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::NotRequired => "not_required",
            Self::Resolved { .. } => "resolved",
            Self::Missing { .. } => "missing",
        }
    }
}

/// Resolves descriptor credentials through their ordered lookup list.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new(Arc::new(EnvCredentialStore))
    }
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub fn resolve(&self, descriptor: &SourceDescriptor) -> CredentialResolution {
        if !descriptor.requires_credential {
            return CredentialResolution::NotRequired;
        }

        for (position, name) in descriptor.credential_lookups.iter().enumerate() {
            if let Some(secret) = self.store.lookup(name) {
                tracing::info!(
                    source = %descriptor.id,
                    lookup = %name,
                    fallback = position > 0,
                    "credential resolved"
                );
                return CredentialResolution::Resolved {
                    via: name.clone(),
                    secret,
                };
            }
            tracing::debug!(source = %descriptor.id, lookup = %name, "credential lookup missed");
        }

        tracing::warn!(
            source = %descriptor.id,
            tried = descriptor.credential_lookups.len(),
            "no credential resolved; source disabled"
        );
        CredentialResolution::Missing {
            tried: descriptor.credential_lookups.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SourceRegistry;

    fn candid() -> SourceDescriptor {
        SourceRegistry::default_catalog()
            .get("candid")
            .expect("candid is in the default catalog")
            .clone()
    }

    #[test]
    fn primary_lookup_wins_when_present() {
        let store = MapCredentialStore::new()
            .with("CANDID_GRANTS_KEYS", "primary")
            .with("CANDID_KEY", "fallback");
        let resolver = CredentialResolver::new(Arc::new(store));

        let resolution = resolver.resolve(&candid());
        assert_eq!(resolution.lookup_name(), Some("CANDID_GRANTS_KEYS"));
        assert_eq!(resolution.secret().map(Secret::expose), Some("primary"));
    }

    #[test]
    fn falls_back_in_order_and_skips_blank_values() {
        let store = MapCredentialStore::new()
            .with("CANDID_GRANTS_KEYS", "   ")
            .with("CANDID_KEY", "fallback");
        let resolver = CredentialResolver::new(Arc::new(store));

        let resolution = resolver.resolve(&candid());
        assert_eq!(resolution.lookup_name(), Some("CANDID_KEY"));
    }

    #[test]
    fn missing_when_no_lookup_resolves() {
        let resolver = CredentialResolver::new(Arc::new(MapCredentialStore::new()));

        let resolution = resolver.resolve(&candid());
        assert_eq!(
            resolution,
            CredentialResolution::Missing {
                tried: vec![String::from("CANDID_GRANTS_KEYS"), String::from("CANDID_KEY")],
            }
        );
        assert!(!resolution.is_usable());
    }

    #[test]
    fn layered_store_prefers_earlier_layers() {
        let explicit: Arc<dyn CredentialStore> =
            Arc::new(MapCredentialStore::new().with("KEY", "explicit"));
        let fallback: Arc<dyn CredentialStore> =
            Arc::new(MapCredentialStore::new().with("KEY", "env").with("OTHER", "x"));
        let layered = LayeredCredentialStore::new(vec![explicit, fallback]);

        assert_eq!(layered.lookup("KEY").as_ref().map(Secret::expose), Some("explicit"));
        assert_eq!(layered.lookup("OTHER").as_ref().map(Secret::expose), Some("x"));
        assert!(layered.lookup("NONE").is_none());
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("hunter2-credential");
        assert_eq!(format!("{secret:?}"), "Secret([REDACTED])");
    }
}

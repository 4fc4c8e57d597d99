//! Static source descriptors.
//!
//! The registry is the single source of truth for which sources exist, how they
//! are reached and how aggressively they are protected. Runtime state (breaker,
//! rate window, resolved credential) lives in the orchestrator.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::data_source::CapabilitySet;
use crate::normalize::{pointers, FieldMapping};
use crate::rate_limiter::RateLimitPolicy;
use crate::{DateFormat, GrantStatus, SourceId, ValidationError};

/// Static configuration for one upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub id: SourceId,
    pub display_name: String,
    /// `None` enables the source automatically once its credential (if any) resolves.
    /// `Some(false)` keeps it disabled regardless.
    pub enabled: Option<bool>,
    pub requires_credential: bool,
    /// Credential lookup names in priority order.
    pub credential_lookups: Vec<String>,
    pub endpoint: String,
    /// Public landing page, reported as `source_url` on records.
    pub homepage: String,
    pub rate_limit: RateLimitPolicy,
    pub cache_ttl: Duration,
    pub breaker: CircuitBreakerConfig,
    pub capabilities: CapabilitySet,
    pub field_mapping: FieldMapping,
}

impl SourceDescriptor {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let zero = |field: &'static str| ValidationError::ZeroPolicyValue {
            source_id: self.id.to_string(),
            field,
        };
        if self.rate_limit.calls == 0 {
            return Err(zero("rate_limit_calls"));
        }
        if self.rate_limit.period.is_zero() {
            return Err(zero("rate_limit_period_secs"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(zero("failure_threshold"));
        }
        if self.breaker.credential_failure_threshold == Some(0) {
            return Err(zero("credential_failure_threshold"));
        }
        if self.breaker.half_open_max_calls == 0 {
            return Err(zero("half_open_max_calls"));
        }
        if self.breaker.cooldown.is_zero() {
            return Err(zero("cooldown_minutes"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "endpoint" });
        }
        if self.requires_credential && self.credential_lookups.is_empty() {
            return Err(ValidationError::EmptyField {
                field: "credential_lookups",
            });
        }
        self.field_mapping.validate()
    }
}

/// Ordered collection of source descriptors keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceRegistry {
    sources: BTreeMap<SourceId, SourceDescriptor>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in catalog: Grants.gov, Candid and the Federal Register.
    pub fn default_catalog() -> Self {
        let mut registry = Self::new();
        for descriptor in [grants_gov(), candid(), federal_register()] {
            registry.insert(descriptor);
        }
        registry
    }

    /// Validates and adds a descriptor, replacing any existing one with the same id.
    pub fn register(&mut self, descriptor: SourceDescriptor) -> Result<(), ValidationError> {
        descriptor.validate()?;
        self.insert(descriptor);
        Ok(())
    }

    fn insert(&mut self, descriptor: SourceDescriptor) {
        self.sources.insert(descriptor.id.clone(), descriptor);
    }

    pub fn get(&self, id: &str) -> Option<&SourceDescriptor> {
        self.sources.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SourceDescriptor> {
        self.sources.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &SourceId> {
        self.sources.keys()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.iter().try_for_each(SourceDescriptor::validate)
    }
}

fn static_id(value: &str) -> SourceId {
    SourceId::parse(value).expect("built-in source ids are valid")
}

fn grants_gov() -> SourceDescriptor {
    let mut mapping = FieldMapping::new("/data/oppHits", &["/id"], &["/title"]);
    mapping.funder = pointers(&["/agencyName", "/agency"]);
    mapping.deadline = pointers(&["/closeDate"]);
    mapping.status = pointers(&["/oppStatus"]);
    mapping.tags = pointers(&["/cfdaList"]);
    mapping.deadline_formats =
        vec![DateFormat::new("[month]/[day]/[year]").expect("built-in date format is valid")];
    mapping.link_template = Some(String::from(
        "https://www.grants.gov/search-results-detail/{id}",
    ));
    mapping.default_status = GrantStatus::Open;

    SourceDescriptor {
        id: static_id("grants_gov"),
        display_name: String::from("Grants.gov"),
        enabled: None,
        requires_credential: false,
        credential_lookups: Vec::new(),
        endpoint: String::from("https://api.grants.gov/v1/api/search2"),
        homepage: String::from("https://www.grants.gov"),
        rate_limit: RateLimitPolicy::per_minute(60),
        cache_ttl: Duration::from_secs(60 * 60),
        breaker: CircuitBreakerConfig::public_source(),
        capabilities: CapabilitySet::new(true, true, false, true),
        field_mapping: mapping,
    }
}

fn candid() -> SourceDescriptor {
    let mut mapping = FieldMapping::new("/data/rows", &["/grant_key", "/id"], &["/title", "/grant_description"]);
    mapping.funder = pointers(&["/funder_name"]);
    mapping.amount_min = pointers(&["/amount_usd", "/amount"]);
    mapping.amount_max = pointers(&["/amount_usd", "/amount"]);
    mapping.description = pointers(&["/grant_description"]);
    mapping.eligibility = pointers(&["/recipient_type"]);
    mapping.link = pointers(&["/url"]);
    mapping.tags = pointers(&["/subjects", "/support_strategies"]);
    mapping.status = pointers(&["/status"]);
    mapping.default_status = GrantStatus::Awarded;

    SourceDescriptor {
        id: static_id("candid"),
        display_name: String::from("Candid"),
        enabled: None,
        requires_credential: true,
        credential_lookups: vec![String::from("CANDID_GRANTS_KEYS"), String::from("CANDID_KEY")],
        endpoint: String::from("https://api.candid.org/grants/v1/transactions"),
        homepage: String::from("https://candid.org"),
        rate_limit: RateLimitPolicy::per_minute(10),
        cache_ttl: Duration::from_secs(24 * 60 * 60),
        breaker: CircuitBreakerConfig::credential_source(),
        capabilities: CapabilitySet::full(),
        field_mapping: mapping,
    }
}

fn federal_register() -> SourceDescriptor {
    let mut mapping = FieldMapping::new("/results", &["/document_number"], &["/title"]);
    mapping.funder = pointers(&["/agencies/0/name"]);
    mapping.description = pointers(&["/abstract"]);
    mapping.link = pointers(&["/html_url"]);
    mapping.static_tags = vec![String::from("federal_register")];
    mapping.default_status = GrantStatus::Open;

    SourceDescriptor {
        id: static_id("federal_register"),
        display_name: String::from("Federal Register"),
        enabled: None,
        requires_credential: false,
        credential_lookups: Vec::new(),
        endpoint: String::from("https://www.federalregister.gov/api/v1/documents.json"),
        homepage: String::from("https://www.federalregister.gov"),
        rate_limit: RateLimitPolicy::per_minute(100).rolling(),
        cache_ttl: Duration::from_secs(6 * 60 * 60),
        breaker: CircuitBreakerConfig::public_source(),
        capabilities: CapabilitySet::new(true, false, false, false),
        field_mapping: mapping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_is_valid_and_ordered() {
        let registry = SourceRegistry::default_catalog();

        registry.validate().expect("built-in catalog validates");
        let ids = registry.ids().map(SourceId::as_str).collect::<Vec<_>>();
        assert_eq!(ids, vec!["candid", "federal_register", "grants_gov"]);
    }

    #[test]
    fn credential_gated_sources_use_the_stricter_breaker() {
        let registry = SourceRegistry::default_catalog();
        let candid = registry.get("candid").expect("candid");
        let grants_gov = registry.get("grants_gov").expect("grants_gov");

        assert!(candid.requires_credential);
        assert_eq!(candid.breaker.failure_threshold, 3);
        assert_eq!(candid.breaker.cooldown, Duration::from_secs(30 * 60));
        assert_eq!(grants_gov.breaker.failure_threshold, 5);
        assert_eq!(grants_gov.breaker.cooldown, Duration::from_secs(15 * 60));
    }

    #[test]
    fn register_rejects_zero_policy_values() {
        let mut descriptor = grants_gov();
        descriptor.rate_limit.calls = 0;

        let mut registry = SourceRegistry::new();
        assert_eq!(
            registry.register(descriptor),
            Err(ValidationError::ZeroPolicyValue {
                source_id: String::from("grants_gov"),
                field: "rate_limit_calls",
            })
        );
        assert!(registry.is_empty());
    }
}

//! The API manager: composes registry, credentials, breakers, rate windows,
//! cache and adapters behind two query operations.
//!
//! # Dispatch path
//!
//! ```text
//! enabled? -> can_execute? -> cache -> in-flight gate -> cache -> can_execute?
//!          -> rate budget -> breaker admission (refund on rejection)
//!          -> fetch (timeout, cancellable) -> normalize
//!          -> record outcome (sanitized on failure) -> cache store
//! ```
//!
//! Direct single-source calls only fail for programmer-class errors (unknown
//! source, manager shut down). Every upstream problem becomes a
//! [`SourceOutcome`] with zero records.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheKey, CacheStore};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::GrantBridgeConfig;
use crate::credentials::{
    CredentialResolution, CredentialResolver, CredentialStore, EnvCredentialStore, Secret,
};
use crate::data_source::{FetchContext, FetchError, GrantSource, NormalizeContext, SearchParams};
use crate::rate_limiter::{RateLimitWindow, SourceRateLimiter};
use crate::registry::{SourceDescriptor, SourceRegistry};
use crate::sanitizer::{ErrorClass, ErrorSanitizer};
use crate::{CanonicalGrantRecord, CoreError, SourceId, ValidationError};

/// Lookup name reported for credentials assigned at runtime.
pub const ASSIGNED_CREDENTIAL: &str = "assigned";

/// Programmer-class errors surfaced to direct callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("unknown source '{id}'")]
    UnknownSource { id: String },
    #[error("no adapter registered for source '{id}'")]
    MissingAdapter { id: String },
    #[error("adapter '{id}' has no descriptor in the registry")]
    UnregisteredDescriptor { id: String },
    #[error("api manager has been shut down")]
    ShutDown,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Orchestrator-wide tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Upper bound on a single upstream fetch.
    pub request_timeout: Duration,
    /// Sources fetched in parallel by one search.
    pub max_concurrency: usize,
    /// Drop records with an id already seen in the same search. Record ids carry
    /// the source prefix, so only repeats from the same source are merged.
    pub dedupe_results: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            max_concurrency: 4,
            dedupe_results: true,
        }
    }
}

/// What happened when a source was asked for records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SourceOutcome {
    /// Fetched from upstream just now.
    Fresh,
    /// Served from cache.
    Cached,
    /// Disabled by configuration or missing credential.
    Disabled,
    CircuitOpen {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    RateLimited { retry_after_secs: u64 },
    /// The call was made and failed; `message` is sanitized.
    Failed { class: ErrorClass, message: String },
    /// Named in a search selection but not configured.
    NotConfigured,
}

impl SourceOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Cached => "cached",
            Self::Disabled => "disabled",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimited { .. } => "rate_limited",
            Self::Failed { .. } => "failed",
            Self::NotConfigured => "not_configured",
        }
    }

    /// Reason token for outcomes that carry no data.
    pub const fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Fresh | Self::Cached => None,
            other => Some(other.as_str()),
        }
    }

    pub const fn is_available(&self) -> bool {
        matches!(self, Self::Fresh | Self::Cached)
    }
}

/// Records from one source plus how they were obtained.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceResult {
    pub source: SourceId,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
    pub records: Vec<CanonicalGrantRecord>,
}

impl SourceResult {
    fn empty(source: SourceId, outcome: SourceOutcome) -> Self {
        Self {
            source,
            outcome,
            records: Vec::new(),
        }
    }
}

/// Per-source line of an aggregate search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    /// Source id as requested; may name an unconfigured source.
    pub source: String,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
    pub record_count: usize,
}

/// Merged result of an aggregate search.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResults {
    pub records: Vec<CanonicalGrantRecord>,
    pub sources: Vec<SourceReport>,
}

impl SearchResults {
    pub fn available_count(&self) -> usize {
        self.sources
            .iter()
            .filter(|report| report.outcome.is_available())
            .count()
    }

    /// True when no source could answer, as opposed to sources answering with nothing.
    pub fn all_unavailable(&self) -> bool {
        self.available_count() == 0
    }

    /// True when some sources answered and some did not.
    pub fn is_partial(&self) -> bool {
        let available = self.available_count();
        available > 0 && available < self.sources.len()
    }

    pub fn unavailable(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources
            .iter()
            .filter(|report| !report.outcome.is_available())
    }
}

/// Which sources an aggregate search fans out to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SourceSelection {
    /// Every configured source; disabled ones report `disabled` without being called.
    #[default]
    All,
    Only(Vec<String>),
}

/// Descriptor and runtime state of one source, for administrative listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceOverview {
    pub source: SourceId,
    pub display_name: String,
    pub enabled: bool,
    pub requires_credential: bool,
    pub credential: &'static str,
    /// Name of the lookup that produced the credential; never the value.
    pub credential_lookup: Option<String>,
    pub capabilities: Vec<&'static str>,
    pub cache_ttl_minutes: u64,
    pub rate_limit: RateLimitWindow,
    pub circuit_breaker: CircuitBreakerStatus,
}

struct SourceSlot {
    descriptor: SourceDescriptor,
    adapter: Arc<dyn GrantSource>,
    breaker: CircuitBreaker,
    limiter: SourceRateLimiter,
    credential: RwLock<CredentialResolution>,
    /// Operator intent; the source is dispatched only if this is set and the credential is usable.
    enabled: AtomicBool,
}

impl SourceSlot {
    fn id(&self) -> &SourceId {
        &self.descriptor.id
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && self.credential_read().is_usable()
    }

    fn credential_read(&self) -> std::sync::RwLockReadGuard<'_, CredentialResolution> {
        self.credential
            .read()
            .expect("credential slot lock is not poisoned")
    }
}

/// Builds an [`ApiManager`]. `build` is the start phase of the manager lifecycle.
pub struct ApiManagerBuilder {
    registry: SourceRegistry,
    adapters: Vec<Arc<dyn GrantSource>>,
    credentials: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    settings: ManagerSettings,
    sanitizer: ErrorSanitizer,
}

impl ApiManagerBuilder {
    pub fn new(registry: SourceRegistry) -> Self {
        Self {
            registry,
            adapters: Vec::new(),
            credentials: Arc::new(EnvCredentialStore),
            clock: Arc::new(SystemClock),
            settings: ManagerSettings::default(),
            sanitizer: ErrorSanitizer::default(),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn GrantSource>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_adapters(mut self, adapters: impl IntoIterator<Item = Arc<dyn GrantSource>>) -> Self {
        self.adapters.extend(adapters);
        self
    }

    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: ErrorSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Validates descriptors and adapters, resolves credentials and creates one
    /// breaker and one rate window per source.
    ///
    /// # Errors
    /// [`ManagerError::UnregisteredDescriptor`] for an adapter without a descriptor,
    /// [`ManagerError::MissingAdapter`] for a descriptor without an adapter, and
    /// [`ManagerError::Validation`] for an invalid descriptor or zero concurrency.
    pub fn build(self) -> Result<ApiManager, ManagerError> {
        self.registry.validate()?;
        if self.settings.max_concurrency == 0 {
            return Err(ValidationError::ZeroPolicyValue {
                source_id: String::from("orchestrator"),
                field: "max_concurrency",
            }
            .into());
        }

        let mut adapters = HashMap::new();
        for adapter in self.adapters {
            let id = adapter.id();
            if !self.registry.contains(id.as_str()) {
                return Err(ManagerError::UnregisteredDescriptor { id: id.to_string() });
            }
            adapters.insert(id, adapter);
        }

        let resolver = CredentialResolver::new(self.credentials);
        let mut slots = BTreeMap::new();
        for descriptor in self.registry.iter() {
            let adapter = adapters
                .remove(&descriptor.id)
                .ok_or_else(|| ManagerError::MissingAdapter {
                    id: descriptor.id.to_string(),
                })?;

            let resolution = resolver.resolve(descriptor);
            if let Some(secret) = resolution.secret() {
                self.sanitizer.register_secret(secret);
            }
            let enabled = descriptor.enabled != Some(false);
            if !enabled {
                tracing::info!(source = %descriptor.id, "source disabled by configuration");
            }

            slots.insert(
                descriptor.id.clone(),
                SourceSlot {
                    descriptor: descriptor.clone(),
                    adapter,
                    breaker: CircuitBreaker::new(
                        descriptor.id.clone(),
                        descriptor.breaker,
                        Arc::clone(&self.clock),
                    ),
                    limiter: SourceRateLimiter::new(
                        descriptor.id.clone(),
                        descriptor.rate_limit,
                        Arc::clone(&self.clock),
                    ),
                    credential: RwLock::new(resolution),
                    enabled: AtomicBool::new(enabled),
                },
            );
        }

        let manager = ApiManager {
            cache: CacheStore::new(Arc::clone(&self.clock)),
            slots,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            clock: self.clock,
            settings: self.settings,
            sanitizer: self.sanitizer,
        };
        tracing::info!(
            sources = manager.slots.len(),
            enabled = manager.slots.values().filter(|slot| slot.is_enabled()).count(),
            "api manager started"
        );
        Ok(manager)
    }
}

type InFlightMap = Arc<Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>>;

/// Holds the in-flight gate for one cache key; removes the gate when the last holder leaves.
struct InFlightPermit {
    map: InFlightMap,
    key: CacheKey,
    gate: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.map.lock().expect("in-flight map lock is not poisoned");
        // One reference in the map, one here.
        if Arc::strong_count(&self.gate) <= 2 {
            map.remove(&self.key);
        }
    }
}

/// Records an abandoned failure if the fetch is dropped before an outcome is known.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    sanitizer: &'a ErrorSanitizer,
    armed: bool,
}

impl PendingCall<'_> {
    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.armed {
            let failure = self.sanitizer.classify(&FetchError::abandoned());
            tracing::warn!(source = %self.breaker.source(), "fetch abandoned; recorded as failure");
            self.breaker.record_failure(&failure);
        }
    }
}

/// Owns the per-source table and answers single-source and aggregate queries.
pub struct ApiManager {
    slots: BTreeMap<SourceId, SourceSlot>,
    cache: CacheStore,
    in_flight: InFlightMap,
    cancel: CancellationToken,
    clock: Arc<dyn Clock>,
    settings: ManagerSettings,
    sanitizer: ErrorSanitizer,
}

impl std::fmt::Debug for ApiManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiManager").finish_non_exhaustive()
    }
}

impl ApiManager {
    pub fn builder(registry: SourceRegistry) -> ApiManagerBuilder {
        ApiManagerBuilder::new(registry)
    }

    /// Builds a manager over the built-in catalog with `config` merged in.
    ///
    /// # Errors
    /// [`CoreError::Config`] for overrides that do not apply, [`CoreError::Manager`]
    /// when the adapters do not match the catalog.
    pub fn from_config(
        config: &GrantBridgeConfig,
        adapters: impl IntoIterator<Item = Arc<dyn GrantSource>>,
    ) -> Result<Self, CoreError> {
        let mut registry = SourceRegistry::default_catalog();
        config.apply_to(&mut registry)?;
        let manager = Self::builder(registry)
            .with_adapters(adapters)
            .with_settings(config.settings()?)
            .build()?;
        Ok(manager)
    }

    pub const fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn sanitizer(&self) -> &ErrorSanitizer {
        &self.sanitizer
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &SourceId> {
        self.slots.keys()
    }

    pub fn is_enabled(&self, source_id: &str) -> Result<bool, ManagerError> {
        Ok(self.slot(source_id)?.is_enabled())
    }

    /// Fetches records from one source.
    ///
    /// # Errors
    /// Only [`ManagerError::UnknownSource`] and [`ManagerError::ShutDown`]; upstream
    /// problems are reported through [`SourceResult::outcome`].
    pub async fn get_grants_from_source(
        &self,
        source_id: &str,
        params: &SearchParams,
    ) -> Result<SourceResult, ManagerError> {
        let slot = self.slot(source_id)?;
        if self.cancel.is_cancelled() {
            return Err(ManagerError::ShutDown);
        }
        Ok(self.dispatch(slot, params).await)
    }

    /// Fans out to the selected sources and merges whatever they return. Never fails.
    pub async fn search_opportunities(
        &self,
        params: &SearchParams,
        selection: &SourceSelection,
    ) -> SearchResults {
        if self.cancel.is_cancelled() {
            tracing::debug!("search after shutdown; returning empty result");
            return SearchResults::default();
        }

        let mut reports = Vec::new();
        let targets: Vec<&SourceSlot> = match selection {
            SourceSelection::All => self.slots.values().collect(),
            SourceSelection::Only(ids) => {
                let mut targets = Vec::new();
                for id in ids.iter().map(|id| id.trim()).collect::<BTreeSet<_>>() {
                    match self.slots.get(id) {
                        Some(slot) => targets.push(slot),
                        None => reports.push(SourceReport {
                            source: id.to_owned(),
                            outcome: SourceOutcome::NotConfigured,
                            record_count: 0,
                        }),
                    }
                }
                targets
            }
        };

        let results = stream::iter(targets)
            .map(|slot| self.dispatch(slot, params))
            .buffer_unordered(self.settings.max_concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut records = Vec::new();
        for result in results {
            reports.push(SourceReport {
                source: result.source.to_string(),
                outcome: result.outcome,
                record_count: result.records.len(),
            });
            records.extend(result.records);
        }

        reports.sort_by(|left, right| left.source.cmp(&right.source));
        records.sort_by(|left, right| {
            left.source
                .cmp(&right.source)
                .then_with(|| left.id.cmp(&right.id))
        });
        if self.settings.dedupe_results {
            records.dedup_by(|later, earlier| later.id == earlier.id);
        }

        let results = SearchResults {
            records,
            sources: reports,
        };
        tracing::info!(
            records = results.records.len(),
            available = results.available_count(),
            sources = results.sources.len(),
            "search completed"
        );
        results
    }

    /// Read-only breaker status for one source, or all sources when `source_id` is `None`.
    pub fn circuit_breaker_status(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<CircuitBreakerStatus>, ManagerError> {
        match source_id {
            Some(id) => Ok(vec![self.slot(id)?.breaker.status()]),
            None => Ok(self
                .slots
                .values()
                .map(|slot| slot.breaker.status())
                .collect()),
        }
    }

    /// Forces the breaker closed and zeroes its counters. Returns false for an unknown source.
    pub fn reset_circuit_breaker(&self, source_id: &str) -> bool {
        match self.slots.get(source_id) {
            Some(slot) => {
                slot.breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Enables or disables a source. A credential-gated source stays undispatched
    /// until a credential is available.
    pub fn set_source_enabled(&self, source_id: &str, enabled: bool) -> Result<(), ManagerError> {
        let slot = self.slot(source_id)?;
        slot.enabled.store(enabled, Ordering::Release);
        tracing::info!(source = %slot.id(), enabled, "source enablement changed");
        Ok(())
    }

    /// Assigns a credential at runtime and registers it with the sanitizer.
    pub fn assign_credential(&self, source_id: &str, secret: Secret) -> Result<(), ManagerError> {
        let slot = self.slot(source_id)?;
        self.sanitizer.register_secret(&secret);
        *slot
            .credential
            .write()
            .expect("credential slot lock is not poisoned") = CredentialResolution::Resolved {
            via: String::from(ASSIGNED_CREDENTIAL),
            secret,
        };
        tracing::info!(source = %slot.id(), "credential assigned");
        Ok(())
    }

    /// Drops cached results for one source, or all sources. Returns the number removed.
    pub async fn flush_cache(&self, source_id: Option<&str>) -> Result<usize, ManagerError> {
        let removed = match source_id {
            Some(id) => self.cache.flush(Some(self.slot(id)?.id())).await,
            None => self.cache.flush(None).await,
        };
        tracing::debug!(removed, "cache flushed");
        Ok(removed)
    }

    pub async fn purge_expired(&self) -> usize {
        self.cache.purge_expired().await
    }

    pub fn source_overview(&self) -> Vec<SourceOverview> {
        self.slots
            .values()
            .map(|slot| {
                let credential = slot.credential_read();
                SourceOverview {
                    source: slot.id().clone(),
                    display_name: slot.descriptor.display_name.clone(),
                    enabled: slot.enabled.load(Ordering::Acquire) && credential.is_usable(),
                    requires_credential: slot.descriptor.requires_credential,
                    credential: credential.label(),
                    credential_lookup: credential.lookup_name().map(str::to_owned),
                    capabilities: slot.descriptor.capabilities.supported(),
                    cache_ttl_minutes: slot.descriptor.cache_ttl.as_secs() / 60,
                    rate_limit: slot.limiter.snapshot(),
                    circuit_breaker: slot.breaker.status(),
                }
            })
            .collect()
    }

    /// Cancels in-flight fetches and rejects further direct calls.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            tracing::info!("api manager shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn slot(&self, source_id: &str) -> Result<&SourceSlot, ManagerError> {
        self.slots
            .get(source_id.trim())
            .ok_or_else(|| ManagerError::UnknownSource {
                id: source_id.to_owned(),
            })
    }

    async fn dispatch(&self, slot: &SourceSlot, params: &SearchParams) -> SourceResult {
        let source = slot.id().clone();

        if !slot.is_enabled() {
            return SourceResult::empty(source, SourceOutcome::Disabled);
        }
        if !slot.breaker.can_execute() {
            return SourceResult::empty(source, self.circuit_open(slot));
        }

        let key = CacheKey::new(source.clone(), params);
        if let Some(records) = self.cache.get(&key).await {
            tracing::debug!(source = %source, "cache hit");
            return cached(source, &records);
        }

        let _permit = self.enter_in_flight(&key).await;
        if let Some(records) = self.cache.get(&key).await {
            tracing::debug!(source = %source, "cache filled by concurrent request");
            return cached(source, &records);
        }

        // The circuit may have opened while this request waited on the gate.
        if !slot.breaker.can_execute() {
            return SourceResult::empty(source, self.circuit_open(slot));
        }
        if let Err(limited) = slot.limiter.try_acquire() {
            return SourceResult::empty(
                source,
                SourceOutcome::RateLimited {
                    retry_after_secs: limited.retry_after.as_secs(),
                },
            );
        }
        if slot.breaker.try_acquire().is_err() {
            slot.limiter.refund();
            return SourceResult::empty(source, self.circuit_open(slot));
        }

        let credential = slot.credential_read().secret().cloned();
        let ctx = FetchContext {
            descriptor: &slot.descriptor,
            params,
            credential: credential.as_ref(),
            timeout: self.settings.request_timeout,
        };

        let pending = PendingCall {
            breaker: &slot.breaker,
            sanitizer: &self.sanitizer,
            armed: true,
        };
        let timeout = self.settings.request_timeout;
        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => Err(FetchError::abandoned()),
            result = tokio::time::timeout(timeout, slot.adapter.fetch(ctx)) => {
                result.unwrap_or_else(|_| Err(FetchError::timeout(timeout)))
            }
        };
        let normalized = fetched.and_then(|payload| {
            slot.adapter.normalize(
                &payload,
                NormalizeContext {
                    descriptor: &slot.descriptor,
                    discovered_at: self.clock.now(),
                },
            )
        });
        pending.settle();

        match normalized {
            Ok(mut records) => {
                records.truncate(params.limit);
                slot.breaker.record_success();
                tracing::info!(source = %source, records = records.len(), "fetched from upstream");
                let records = Arc::new(records);
                self.cache
                    .put(key, Arc::clone(&records), slot.descriptor.cache_ttl)
                    .await;
                SourceResult {
                    source,
                    outcome: SourceOutcome::Fresh,
                    records: records.as_ref().clone(),
                }
            }
            Err(error) => {
                let failure = self.sanitizer.classify(&error);
                tracing::warn!(
                    source = %source,
                    code = error.code(),
                    class = %failure.class(),
                    message = failure.message(),
                    "source fetch failed"
                );
                slot.breaker.record_failure(&failure);
                if failure.class() == ErrorClass::RateLimit {
                    slot.limiter.exhaust();
                }
                SourceResult::empty(
                    source,
                    SourceOutcome::Failed {
                        class: failure.class(),
                        message: failure.message().to_owned(),
                    },
                )
            }
        }
    }

    fn circuit_open(&self, slot: &SourceSlot) -> SourceOutcome {
        let status = slot.breaker.status();
        tracing::debug!(source = %slot.id(), state = %status.state, "circuit rejected call");
        SourceOutcome::CircuitOpen {
            retry_after_secs: status.retry_after_secs,
        }
    }

    async fn enter_in_flight(&self, key: &CacheKey) -> InFlightPermit {
        let gate = {
            let mut map = self
                .in_flight
                .lock()
                .expect("in-flight map lock is not poisoned");
            Arc::clone(map.entry(key.clone()).or_default())
        };
        let guard = Arc::clone(&gate).lock_owned().await;
        InFlightPermit {
            map: Arc::clone(&self.in_flight),
            key: key.clone(),
            gate,
            guard: Some(guard),
        }
    }
}

fn cached(source: SourceId, records: &[CanonicalGrantRecord]) -> SourceResult {
    SourceResult {
        source,
        outcome: SourceOutcome::Cached,
        records: records.to_vec(),
    }
}

impl Drop for ApiManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::credentials::MapCredentialStore;
    use crate::data_source::{FetchFuture, RawPayload};
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        id: SourceId,
        calls: AtomicUsize,
        payload: Result<RawPayload, FetchError>,
    }

    impl GrantSource for CountingSource {
        fn id(&self) -> SourceId {
            self.id.clone()
        }

        fn fetch<'a>(&'a self, _ctx: FetchContext<'a>) -> FetchFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let payload = self.payload.clone();
            Box::pin(async move { payload })
        }
    }

    fn grants_gov_source(payload: Result<RawPayload, FetchError>) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            id: SourceId::parse("grants_gov").expect("valid"),
            calls: AtomicUsize::new(0),
            payload,
        })
    }

    fn registry_with_grants_gov() -> SourceRegistry {
        let catalog = SourceRegistry::default_catalog();
        let mut registry = SourceRegistry::new();
        registry
            .register(catalog.get("grants_gov").expect("grants_gov").clone())
            .expect("valid");
        registry
    }

    fn hits() -> RawPayload {
        serde_json::json!({ "data": { "oppHits": [{ "id": "1", "title": "Rural Health" }] } })
    }

    #[tokio::test]
    async fn build_rejects_missing_and_unregistered_adapters() {
        let missing = ApiManager::builder(registry_with_grants_gov()).build();
        assert!(matches!(missing, Err(ManagerError::MissingAdapter { id }) if id == "grants_gov"));

        let stray = Arc::new(CountingSource {
            id: SourceId::parse("stray").expect("valid"),
            calls: AtomicUsize::new(0),
            payload: Ok(hits()),
        });
        let unregistered = ApiManager::builder(registry_with_grants_gov())
            .with_adapter(grants_gov_source(Ok(hits())))
            .with_adapter(stray)
            .build();
        assert!(matches!(
            unregistered,
            Err(ManagerError::UnregisteredDescriptor { id }) if id == "stray"
        ));
    }

    #[tokio::test]
    async fn unknown_source_is_a_hard_error_and_reset_reports_false() {
        let manager = ApiManager::builder(registry_with_grants_gov())
            .with_adapter(grants_gov_source(Ok(hits())))
            .build()
            .expect("builds");

        let error = manager
            .get_grants_from_source("nope", &SearchParams::new("x"))
            .await
            .expect_err("unknown");
        assert_eq!(error, ManagerError::UnknownSource { id: String::from("nope") });
        assert!(!manager.reset_circuit_breaker("nope"));
        assert!(manager.reset_circuit_breaker("grants_gov"));
    }

    #[tokio::test]
    async fn disabled_source_is_never_called() {
        let source = grants_gov_source(Ok(hits()));
        let manager = ApiManager::builder(registry_with_grants_gov())
            .with_adapter(source.clone())
            .with_credential_store(Arc::new(MapCredentialStore::new()))
            .build()
            .expect("builds");
        manager.set_source_enabled("grants_gov", false).expect("known");

        let result = manager
            .get_grants_from_source("grants_gov", &SearchParams::new("x"))
            .await
            .expect("known source");

        assert_eq!(result.outcome, SourceOutcome::Disabled);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rate_limited_failure_exhausts_window() {
        let source = grants_gov_source(Err(FetchError::status(429, "Too Many Requests")));
        let manager = ApiManager::builder(registry_with_grants_gov())
            .with_adapter(source.clone())
            .with_clock(Arc::new(ManualClock::default()))
            .build()
            .expect("builds");

        let first = manager
            .get_grants_from_source("grants_gov", &SearchParams::new("a"))
            .await
            .expect("known");
        assert!(matches!(
            first.outcome,
            SourceOutcome::Failed { class: ErrorClass::RateLimit, .. }
        ));

        let second = manager
            .get_grants_from_source("grants_gov", &SearchParams::new("b"))
            .await
            .expect("known");
        assert_eq!(second.outcome.reason(), Some("rate_limited"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_direct_calls_and_empties_searches() {
        let manager = ApiManager::builder(registry_with_grants_gov())
            .with_adapter(grants_gov_source(Ok(hits())))
            .build()
            .expect("builds");

        manager.shutdown();

        assert_eq!(
            manager
                .get_grants_from_source("grants_gov", &SearchParams::new("x"))
                .await,
            Err(ManagerError::ShutDown)
        );
        let results = manager
            .search_opportunities(&SearchParams::new("x"), &SourceSelection::All)
            .await;
        assert!(results.records.is_empty());
        assert!(results.all_unavailable());
    }
}

//! Source integration and resilience layer for grantbridge.
//!
//! This crate contains:
//! - The canonical grant record and its deadline/status vocabulary
//! - Source descriptors, credential resolution and configuration
//! - Per-source circuit breakers, rate windows and a result cache
//! - Source adapters and a declarative payload normalizer
//! - The error sanitizer every upstream message passes through
//! - The [`ApiManager`] orchestrating all of the above

pub mod adapters;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod data_source;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod http_client;
pub mod normalize;
pub mod orchestrator;
pub mod rate_limiter;
pub mod registry;
pub mod sanitizer;
pub mod source;

pub use adapters::{default_adapters, CandidAdapter, GrantsGovAdapter, MappedFeedAdapter};
pub use cache::{CacheKey, CacheStore};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitRejection, CircuitState,
    StateTransition,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GrantBridgeConfig, OrchestratorConfig, SourceOverride};
pub use credentials::{
    CredentialResolution, CredentialResolver, CredentialStore, EnvCredentialStore,
    LayeredCredentialStore, MapCredentialStore, Secret,
};
pub use data_source::{
    Capability, CapabilitySet, FetchContext, FetchError, FetchErrorKind, FetchFuture, GrantSource,
    NormalizeContext, RawPayload, SearchParams, DEFAULT_LIMIT,
};
pub use domain::{CanonicalGrantRecord, DateFormat, Deadline, GrantStatus, UtcDateTime};
pub use envelope::{Envelope, EnvelopeError, EnvelopeMeta, SCHEMA_VERSION};
pub use error::{CoreError, ValidationError};
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpErrorKind, HttpMethod, HttpRequest, HttpResponse,
    ReqwestHttpClient, StaticHttpClient,
};
pub use normalize::FieldMapping;
pub use orchestrator::{
    ApiManager, ApiManagerBuilder, ManagerError, ManagerSettings, SearchResults, SourceOutcome,
    SourceOverview, SourceReport, SourceResult, SourceSelection,
};
pub use rate_limiter::{RateLimitPolicy, RateLimitWindow, RateLimited, SourceRateLimiter, WindowKind};
pub use registry::{SourceDescriptor, SourceRegistry};
pub use sanitizer::{
    redact_credentials, ClassificationRules, ClassifiedFailure, ErrorClass, ErrorSanitizer,
    REDACTED,
};
pub use source::SourceId;

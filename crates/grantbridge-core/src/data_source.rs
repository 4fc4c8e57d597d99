//! Source adapter contract and request/response types.
//!
//! Every upstream provider is wrapped in a [`GrantSource`]. Adapters only know how
//! to call their upstream and hand back its raw JSON payload; gating, caching,
//! rate accounting and failure classification live in the orchestrator.
//!
//! # Example
//!
//! ```rust,ignore
//! use grantbridge_core::{GrantSource, FetchContext, RawPayload, FetchError, SourceId};
//!
//! struct MyFeed;
//!
//! impl GrantSource for MyFeed {
//!     fn id(&self) -> SourceId {
//!         SourceId::parse("my_feed").expect("valid id")
//!     }
//!
//!     fn fetch<'a>(&'a self, ctx: FetchContext<'a>) -> FetchFuture<'a> {
//!         Box::pin(async move { Ok(serde_json::json!({ "items": [] })) })
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::credentials::Secret;
use crate::http_client::{HttpError, HttpErrorKind};
use crate::registry::SourceDescriptor;
use crate::{CanonicalGrantRecord, SourceId, UtcDateTime, ValidationError};

/// Default page size requested from each source.
pub const DEFAULT_LIMIT: usize = 25;

/// Upper bound on raw upstream text kept inside a [`FetchError`].
const MAX_RAW_MESSAGE_BYTES: usize = 8 * 1024;

/// Raw upstream payload handed from `fetch` to `normalize`.
pub type RawPayload = serde_json::Value;

/// Boxed future returned by [`GrantSource::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<RawPayload, FetchError>> + Send + 'a>>;

/// Optional features a source supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    KeywordSearch,
    Filters,
    Amounts,
    Deadlines,
}

/// Supported feature matrix for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub keyword_search: bool,
    pub filters: bool,
    pub amounts: bool,
    pub deadlines: bool,
}

impl CapabilitySet {
    pub const fn new(keyword_search: bool, filters: bool, amounts: bool, deadlines: bool) -> Self {
        Self {
            keyword_search,
            filters,
            amounts,
            deadlines,
        }
    }

    pub const fn full() -> Self {
        Self::new(true, true, true, true)
    }

    pub const fn supports(self, capability: Capability) -> bool {
        match capability {
            Capability::KeywordSearch => self.keyword_search,
            Capability::Filters => self.filters,
            Capability::Amounts => self.amounts,
            Capability::Deadlines => self.deadlines,
        }
    }

    pub fn supported(self) -> Vec<&'static str> {
        let mut values = Vec::with_capacity(4);
        if self.keyword_search {
            values.push("keyword_search");
        }
        if self.filters {
            values.push("filters");
        }
        if self.amounts {
            values.push("amounts");
        }
        if self.deadlines {
            values.push("deadlines");
        }
        values
    }
}

/// Query parameters for a source fetch.
///
/// Filters are held in a sorted map so two requests with the same filters in a
/// different order produce the same [`fingerprint`](SearchParams::fingerprint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
    pub filters: BTreeMap<String, String>,
    pub limit: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self::new("")
    }
}

impl SearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into().trim().to_owned(),
            filters: BTreeMap::new(),
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn with_filter(
        mut self,
        key: impl AsRef<str>,
        value: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let key = key.as_ref().trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(ValidationError::EmptyFilterKey);
        }
        self.filters.insert(key, value.into().trim().to_owned());
        Ok(self)
    }

    pub fn with_filters<I, K, V>(self, filters: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        filters
            .into_iter()
            .try_fold(self, |params, (key, value)| params.with_filter(key, value))
    }

    pub fn with_limit(mut self, limit: usize) -> Result<Self, ValidationError> {
        if limit == 0 {
            return Err(ValidationError::ZeroLimit);
        }
        self.limit = limit;
        Ok(self)
    }

    pub fn filter(&self, key: &str) -> Option<&str> {
        self.filters.get(key).map(String::as_str)
    }

    /// Order-independent hash of the parameters, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"q\0");
        hasher.update(self.query.as_bytes());
        hasher.update(b"\0limit\0");
        hasher.update(self.limit.to_string().as_bytes());
        for (key, value) in &self.filters {
            hasher.update(b"\0f\0");
            hasher.update(key.as_bytes());
            hasher.update(b"\0");
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Everything an adapter needs for one upstream call.
#[derive(Debug, Clone, Copy)]
pub struct FetchContext<'a> {
    pub descriptor: &'a SourceDescriptor,
    pub params: &'a SearchParams,
    pub credential: Option<&'a Secret>,
    pub timeout: Duration,
}

/// Inputs for turning a raw payload into canonical records.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub descriptor: &'a SourceDescriptor,
    pub discovered_at: UtcDateTime,
}

/// Adapter-level failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Upstream answered with a non-success HTTP status.
    Status,
    Timeout,
    Connect,
    Transport,
    /// Payload did not match the expected shape.
    Parse,
    /// The call was dropped or cancelled before an outcome was known.
    Abandoned,
}

/// Structured adapter failure. Its message is raw upstream text and must go
/// through the [`ErrorSanitizer`](crate::ErrorSanitizer) before it is shown anywhere.
#[derive(Clone, PartialEq, Eq)]
pub struct FetchError {
    kind: FetchErrorKind,
    status: Option<u16>,
    message: String,
}

impl FetchError {
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::new(
            FetchErrorKind::Status,
            Some(status),
            format!("upstream returned status {status}: {}", body.into()),
        )
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FetchErrorKind::Timeout,
            None,
            format!("request timed out after {}ms", after.as_millis()),
        )
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Connect, None, message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Transport, None, message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Parse, None, message.into())
    }

    pub fn abandoned() -> Self {
        Self::new(
            FetchErrorKind::Abandoned,
            None,
            String::from("call abandoned before an outcome was known"),
        )
    }

    fn new(kind: FetchErrorKind, status: Option<u16>, mut message: String) -> Self {
        if message.len() > MAX_RAW_MESSAGE_BYTES {
            let mut cut = MAX_RAW_MESSAGE_BYTES;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self {
            kind,
            status,
            message,
        }
    }

    pub const fn kind(&self) -> FetchErrorKind {
        self.kind
    }

    pub const fn status_code(&self) -> Option<u16> {
        self.status
    }

    /// Raw, unsanitized message.
    pub fn raw_message(&self) -> &str {
        &self.message
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            FetchErrorKind::Status => "source.status",
            FetchErrorKind::Timeout => "source.timeout",
            FetchErrorKind::Connect => "source.connect",
            FetchErrorKind::Transport => "source.transport",
            FetchErrorKind::Parse => "source.parse",
            FetchErrorKind::Abandoned => "source.abandoned",
        }
    }
}

impl From<HttpError> for FetchError {
    fn from(error: HttpError) -> Self {
        match error.kind() {
            HttpErrorKind::Timeout => Self::new(
                FetchErrorKind::Timeout,
                None,
                error.message().to_owned(),
            ),
            HttpErrorKind::Connect => Self::connect(error.message()),
            HttpErrorKind::Other => Self::transport(error.message()),
        }
    }
}

// Debug and Display omit the raw message.
impl std::fmt::Debug for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchError")
            .field("kind", &self.kind)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {status})", self.code()),
            None => f.write_str(self.code()),
        }
    }
}

impl std::error::Error for FetchError {}

/// Source adapter contract.
///
/// Implementations are registered with the orchestrator by id; adding a source
/// means registering another implementation.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared across concurrent
/// searches.
pub trait GrantSource: Send + Sync {
    /// Returns the id of the descriptor this adapter serves.
    fn id(&self) -> SourceId;

    /// Calls the upstream and returns its raw payload.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on transport failure, non-success status or an
    /// unreadable body. The orchestrator classifies it; adapters never decide
    /// circuit or rate state themselves.
    fn fetch<'a>(&'a self, ctx: FetchContext<'a>) -> FetchFuture<'a>;

    /// Translates a raw payload into canonical records.
    ///
    /// The default applies the descriptor's [`FieldMapping`](crate::FieldMapping).
    fn normalize(
        &self,
        payload: &RawPayload,
        ctx: NormalizeContext<'_>,
    ) -> Result<Vec<CanonicalGrantRecord>, FetchError> {
        ctx.descriptor
            .field_mapping
            .normalize(payload, ctx.descriptor, ctx.discovered_at)
    }
}

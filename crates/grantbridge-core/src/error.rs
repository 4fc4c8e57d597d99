use thiserror::Error;

/// Validation and contract errors exposed by `grantbridge-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("source id cannot be empty")]
    EmptySourceId,
    #[error("source id contains invalid character '{ch}' at index {index}; expected [a-z0-9_]")]
    SourceIdInvalidChar { ch: char, index: usize },
    #[error("source id length {len} exceeds max {max}")]
    SourceIdTooLong { len: usize, max: usize },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("deadline must be an ISO date, 'Rolling', 'unknown' or null: '{value}'")]
    InvalidDeadline { value: String },

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },
    #[error("amount_min must not exceed amount_max")]
    InvalidAmountRange,
    #[error("field '{field}' cannot be empty")]
    EmptyField { field: &'static str },

    #[error("filter key cannot be empty")]
    EmptyFilterKey,
    #[error("search limit must be greater than zero")]
    ZeroLimit,

    #[error("field '{field}' for source '{source_id}' must be greater than zero")]
    ZeroPolicyValue {
        source_id: String,
        field: &'static str,
    },
    #[error("invalid field mapping pointer '{pointer}': JSON pointers start with '/'")]
    InvalidPointer { pointer: String },
    #[error("invalid deadline format '{format}': {reason}")]
    InvalidDateFormat { format: String, reason: String },

    #[error("request_id must be at least 8 characters")]
    InvalidRequestId,
    #[error("schema_version must match vMAJOR.MINOR.PATCH: '{value}'")]
    InvalidSchemaVersion { value: String },
    #[error("error code cannot be empty")]
    EmptyErrorCode,
    #[error("error message cannot be empty")]
    EmptyErrorMessage,
}

/// Failure while assembling a manager from configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Manager(#[from] crate::orchestrator::ManagerError),
}

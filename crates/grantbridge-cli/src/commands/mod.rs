mod fetch;
mod search;
mod sources;

use std::sync::Arc;

use grantbridge_core::{
    default_adapters, ApiManager, Envelope, EnvelopeError, EnvelopeMeta, ErrorClass,
    GrantBridgeConfig, ReqwestHttpClient, SearchParams, SourceId, SourceOutcome, ValidationError,
};
use serde_json::Value;

use crate::cli::{Cli, Command, QueryArgs};
use crate::error::CliError;

pub struct CommandResult {
    pub data: Value,
    pub warnings: Vec<String>,
    pub errors: Vec<EnvelopeError>,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub sources: Vec<SourceId>,
}

impl CommandResult {
    pub fn ok(data: Value, sources: Vec<SourceId>) -> Self {
        Self {
            data,
            warnings: Vec::new(),
            errors: Vec::new(),
            latency_ms: 0,
            cache_hit: false,
            sources,
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_errors(mut self, errors: Vec<EnvelopeError>) -> Self {
        self.errors.extend(errors);
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }
}

pub async fn run(cli: &Cli) -> Result<Envelope<Value>, CliError> {
    let config = GrantBridgeConfig::load_with_env(cli.config.as_deref())?;
    let manager = ApiManager::from_config(
        &config,
        default_adapters(Arc::new(ReqwestHttpClient::new())),
    )?;
    tracing::debug!(sources = manager.source_ids().count(), "api manager ready");

    let command_result = match &cli.command {
        Command::Sources(args) => sources::run(args, &manager),
        Command::Fetch(args) => fetch::run(args, &manager).await,
        Command::Search(args) => search::run(args, &manager).await,
    };
    manager.shutdown();

    let CommandResult {
        data,
        warnings,
        errors,
        latency_ms,
        cache_hit,
        sources,
    } = command_result?;

    let mut meta = EnvelopeMeta::new(
        uuid::Uuid::new_v4().to_string(),
        sources,
        latency_ms,
        cache_hit,
    )?;
    for warning in warnings {
        meta.push_warning(warning);
    }

    Envelope::with_errors(meta, data, errors).map_err(CliError::from)
}

fn search_params(query: &str, args: &QueryArgs) -> Result<SearchParams, ValidationError> {
    let params = SearchParams::new(query).with_filters(args.filters.iter().cloned())?;
    match args.limit {
        Some(limit) => params.with_limit(limit),
        None => Ok(params),
    }
}

/// Envelope entry for an outcome that produced no data.
///
/// `disabled` is a warning; every other unavailable outcome is an error.
enum Notice {
    Warning(String),
    Error(EnvelopeError),
}

fn notice_for(source: &str, outcome: &SourceOutcome) -> Result<Option<Notice>, ValidationError> {
    let message = match outcome {
        SourceOutcome::Fresh | SourceOutcome::Cached => return Ok(None),
        SourceOutcome::Disabled => {
            return Ok(Some(Notice::Warning(format!(
                "source '{source}' is disabled or has no credential"
            ))))
        }
        SourceOutcome::CircuitOpen { retry_after_secs } => match retry_after_secs {
            Some(secs) => format!("circuit open; retry after {secs}s"),
            None => String::from("circuit open"),
        },
        SourceOutcome::RateLimited { retry_after_secs } => {
            format!("rate limit reached; retry after {retry_after_secs}s")
        }
        SourceOutcome::Failed { message, .. } => message.clone(),
        SourceOutcome::NotConfigured => String::from("source is not configured"),
    };
    let retryable = match outcome {
        SourceOutcome::CircuitOpen { .. } | SourceOutcome::RateLimited { .. } => true,
        SourceOutcome::Failed { class, .. } => {
            matches!(class, ErrorClass::Transient | ErrorClass::RateLimit)
        }
        _ => false,
    };

    let code = format!("source.{}", outcome.as_str());
    let error = EnvelopeError::new(code, message)?
        .with_retryable(retryable)
        .with_source(source);
    Ok(Some(Notice::Error(error)))
}

fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_outcomes_map_to_codes_and_retryability() {
        let Ok(Some(Notice::Error(error))) =
            notice_for("grants_gov", &SourceOutcome::RateLimited { retry_after_secs: 12 })
        else {
            panic!("rate limited is an error");
        };
        assert_eq!(error.code, "source.rate_limited");
        assert_eq!(error.retryable, Some(true));
        assert_eq!(error.source.as_deref(), Some("grants_gov"));

        let failed = SourceOutcome::Failed {
            class: ErrorClass::Credential,
            message: String::from("HTTP 401"),
        };
        let Ok(Some(Notice::Error(error))) = notice_for("candid", &failed) else {
            panic!("failed is an error");
        };
        assert_eq!(error.code, "source.failed");
        assert_eq!(error.retryable, Some(false));
    }

    #[test]
    fn disabled_is_a_warning_and_data_outcomes_are_silent() {
        assert!(matches!(
            notice_for("candid", &SourceOutcome::Disabled),
            Ok(Some(Notice::Warning(_)))
        ));
        assert!(matches!(notice_for("candid", &SourceOutcome::Cached), Ok(None)));
    }
}

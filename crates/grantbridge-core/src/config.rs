//! TOML configuration with environment overrides.
//!
//! ```toml
//! [orchestrator]
//! request_timeout_secs = 15
//! max_concurrency = 4
//!
//! [sources.candid]
//! failure_threshold = 2
//! cooldown_minutes = 45
//! credential_lookups = ["CANDID_PROD_KEY", "CANDID_KEY"]
//! ```
//!
//! Overrides are merged into a [`SourceRegistry`] with [`GrantBridgeConfig::apply_to`].
//! Malformed configuration is a hard error; nothing is silently ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::ManagerSettings;
use crate::rate_limiter::WindowKind;
use crate::registry::SourceRegistry;
use crate::ValidationError;

pub const ENV_REQUEST_TIMEOUT_SECS: &str = "GRANTBRIDGE_REQUEST_TIMEOUT_SECS";
pub const ENV_MAX_CONCURRENCY: &str = "GRANTBRIDGE_MAX_CONCURRENCY";
pub const ENV_DISABLED_SOURCES: &str = "GRANTBRIDGE_DISABLED_SOURCES";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config references unknown source '{id}'")]
    UnknownSource { id: String },
    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidEnv { name: &'static str, value: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantBridgeConfig {
    pub orchestrator: OrchestratorConfig,
    /// Per-source overrides keyed by source id.
    pub sources: BTreeMap<String, SourceOverride>,
}

/// Orchestrator-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub request_timeout_secs: u64,
    pub max_concurrency: usize,
    pub dedupe_results: bool,
    /// Breaker transition history kept per source.
    pub history_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 15,
            max_concurrency: 4,
            dedupe_results: true,
            history_limit: 20,
        }
    }
}

/// Optional per-source overrides. Unset fields keep the descriptor's value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceOverride {
    pub enabled: Option<bool>,
    pub endpoint: Option<String>,
    pub failure_threshold: Option<u32>,
    pub credential_failure_threshold: Option<u32>,
    pub cooldown_minutes: Option<u64>,
    pub half_open_max_calls: Option<u32>,
    pub rate_limit_calls: Option<u32>,
    pub rate_limit_period_secs: Option<u64>,
    pub rate_limit_window: Option<WindowKind>,
    /// Zero disables caching for the source.
    pub cache_ttl_minutes: Option<u64>,
    pub credential_lookups: Option<Vec<String>>,
}

impl GrantBridgeConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not valid TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!("Loading config from {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Loads `path` (or defaults when `None`) and applies process environment overrides.
    ///
    /// Supports the following environment variables:
    /// - `GRANTBRIDGE_REQUEST_TIMEOUT_SECS`: per-call timeout
    /// - `GRANTBRIDGE_MAX_CONCURRENCY`: parallel source fetches per search
    /// - `GRANTBRIDGE_DISABLED_SOURCES`: comma separated source ids to disable
    pub fn load_with_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => {
                tracing::debug!("No config file given, using defaults");
                Self::default()
            }
        };
        config.with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides read through `lookup`, which maps a variable name to its value.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_REQUEST_TIMEOUT_SECS) {
            self.orchestrator.request_timeout_secs = parse_env(ENV_REQUEST_TIMEOUT_SECS, &value)?;
            tracing::debug!(
                "Override request_timeout_secs from env: {}",
                self.orchestrator.request_timeout_secs
            );
        }

        if let Some(value) = lookup(ENV_MAX_CONCURRENCY) {
            self.orchestrator.max_concurrency = parse_env(ENV_MAX_CONCURRENCY, &value)?;
            tracing::debug!(
                "Override max_concurrency from env: {}",
                self.orchestrator.max_concurrency
            );
        }

        if let Some(value) = lookup(ENV_DISABLED_SOURCES) {
            for id in value.split(',').map(str::trim).filter(|id| !id.is_empty()) {
                self.sources.entry(id.to_owned()).or_default().enabled = Some(false);
                tracing::debug!("Disable source from env: {}", id);
            }
        }

        Ok(self)
    }

    /// Orchestrator settings derived from the `[orchestrator]` section.
    pub fn settings(&self) -> Result<ManagerSettings, ConfigError> {
        let orchestrator = &self.orchestrator;
        let zero = |field: &'static str| ValidationError::ZeroPolicyValue {
            source_id: String::from("orchestrator"),
            field,
        };
        if orchestrator.request_timeout_secs == 0 {
            return Err(zero("request_timeout_secs").into());
        }
        if orchestrator.max_concurrency == 0 {
            return Err(zero("max_concurrency").into());
        }

        Ok(ManagerSettings {
            request_timeout: Duration::from_secs(orchestrator.request_timeout_secs),
            max_concurrency: orchestrator.max_concurrency,
            dedupe_results: orchestrator.dedupe_results,
        })
    }

    /// Merges overrides into `registry` and re-validates every touched descriptor.
    ///
    /// # Errors
    /// [`ConfigError::UnknownSource`] when an override names a source the registry
    /// does not have; [`ConfigError::Validation`] when a merged descriptor is invalid.
    pub fn apply_to(&self, registry: &mut SourceRegistry) -> Result<(), ConfigError> {
        if let Some(id) = self.sources.keys().find(|id| !registry.contains(id)) {
            return Err(ConfigError::UnknownSource { id: id.clone() });
        }

        let ids = registry.ids().cloned().collect::<Vec<_>>();
        for id in ids {
            let Some(descriptor) = registry.get_mut(id.as_str()) else {
                continue;
            };
            descriptor.breaker.history_limit = self.orchestrator.history_limit;

            let Some(overrides) = self.sources.get(id.as_str()) else {
                continue;
            };
            if let Some(enabled) = overrides.enabled {
                descriptor.enabled = Some(enabled);
            }
            if let Some(endpoint) = &overrides.endpoint {
                descriptor.endpoint = endpoint.clone();
            }
            if let Some(threshold) = overrides.failure_threshold {
                descriptor.breaker.failure_threshold = threshold;
            }
            if let Some(threshold) = overrides.credential_failure_threshold {
                descriptor.breaker.credential_failure_threshold = Some(threshold);
            }
            if let Some(minutes) = overrides.cooldown_minutes {
                descriptor.breaker.cooldown = Duration::from_secs(minutes.saturating_mul(60));
            }
            if let Some(calls) = overrides.half_open_max_calls {
                descriptor.breaker.half_open_max_calls = calls;
            }
            if let Some(calls) = overrides.rate_limit_calls {
                descriptor.rate_limit.calls = calls;
            }
            if let Some(secs) = overrides.rate_limit_period_secs {
                descriptor.rate_limit.period = Duration::from_secs(secs);
            }
            if let Some(window) = overrides.rate_limit_window {
                descriptor.rate_limit.window = window;
            }
            if let Some(minutes) = overrides.cache_ttl_minutes {
                descriptor.cache_ttl = Duration::from_secs(minutes.saturating_mul(60));
            }
            if let Some(lookups) = &overrides.credential_lookups {
                descriptor.credential_lookups = lookups.clone();
            }

            descriptor.validate()?;
            tracing::debug!(source = %id, "applied config overrides");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = GrantBridgeConfig::from_toml_str("").expect("empty config parses");
        let settings = config.settings().expect("defaults are valid");

        assert_eq!(settings.request_timeout, Duration::from_secs(15));
        assert_eq!(settings.max_concurrency, 4);
        assert!(settings.dedupe_results);
        assert_eq!(config.orchestrator.history_limit, 20);
    }

    #[test]
    fn overrides_merge_into_registry() {
        let config = GrantBridgeConfig::from_toml_str(
            r#"
            [orchestrator]
            history_limit = 5

            [sources.candid]
            failure_threshold = 2
            credential_failure_threshold = 1
            cooldown_minutes = 45
            rate_limit_window = "rolling"
            cache_ttl_minutes = 0
            credential_lookups = ["CANDID_PROD_KEY"]
            "#,
        )
        .expect("parses");
        let mut registry = SourceRegistry::default_catalog();

        config.apply_to(&mut registry).expect("applies");

        let candid = registry.get("candid").expect("candid");
        assert_eq!(candid.breaker.failure_threshold, 2);
        assert_eq!(candid.breaker.credential_failure_threshold, Some(1));
        assert_eq!(candid.breaker.cooldown, Duration::from_secs(45 * 60));
        assert_eq!(candid.breaker.history_limit, 5);
        assert_eq!(candid.rate_limit.window, WindowKind::Rolling);
        assert_eq!(candid.cache_ttl, Duration::ZERO);
        assert_eq!(candid.credential_lookups, vec![String::from("CANDID_PROD_KEY")]);
        assert_eq!(
            registry.get("grants_gov").expect("grants_gov").breaker.history_limit,
            5
        );
    }

    #[test]
    fn unknown_source_and_zero_threshold_are_hard_errors() {
        let mut registry = SourceRegistry::default_catalog();

        let unknown = GrantBridgeConfig::from_toml_str("[sources.nope]\nenabled = false")
            .expect("parses");
        assert!(matches!(
            unknown.apply_to(&mut registry),
            Err(ConfigError::UnknownSource { id }) if id == "nope"
        ));

        let zero = GrantBridgeConfig::from_toml_str("[sources.grants_gov]\nfailure_threshold = 0")
            .expect("parses");
        assert!(matches!(
            zero.apply_to(&mut registry),
            Err(ConfigError::Validation(ValidationError::ZeroPolicyValue { .. }))
        ));
    }

    #[test]
    fn misspelled_override_key_is_rejected() {
        let error = GrantBridgeConfig::from_toml_str("[sources.candid]\nfailure_treshold = 2")
            .expect_err("unknown field");
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_apply_and_validate() {
        let config = GrantBridgeConfig::default()
            .with_env_overrides(|name| match name {
                ENV_REQUEST_TIMEOUT_SECS => Some(String::from("3")),
                ENV_DISABLED_SOURCES => Some(String::from("candid, federal_register")),
                _ => None,
            })
            .expect("valid env");

        assert_eq!(config.orchestrator.request_timeout_secs, 3);
        assert_eq!(config.sources["candid"].enabled, Some(false));
        assert_eq!(config.sources["federal_register"].enabled, Some(false));

        let error = GrantBridgeConfig::default()
            .with_env_overrides(|name| (name == ENV_MAX_CONCURRENCY).then(|| String::from("many")))
            .expect_err("invalid number");
        assert!(matches!(error, ConfigError::InvalidEnv { name, .. } if name == ENV_MAX_CONCURRENCY));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[orchestrator]\nmax_concurrency = 9").expect("write");

        let config = GrantBridgeConfig::load(file.path()).expect("loads");
        assert_eq!(config.orchestrator.max_concurrency, 9);

        let missing = GrantBridgeConfig::load("/definitely/not/here.toml").expect_err("missing");
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub api_token: String,
    pub db_path: PathBuf,
    /// Entity types the push boundary accepts
    pub entity_types: Vec<String>,
    /// Hard cap on the `limit` a pull request may ask for
    pub max_pull_limit: usize,
    pub rate_limit_window: Duration,
    pub push_rate_limit_per_window: u32,
    pub pull_rate_limit_per_window: u32,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("api_token", &"[REDACTED]")
            .field("db_path", &self.db_path)
            .field("entity_types", &self.entity_types)
            .field("max_pull_limit", &self.max_pull_limit)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "push_rate_limit_per_window",
                &self.push_rate_limit_per_window,
            )
            .field(
                "pull_rate_limit_per_window",
                &self.pull_rate_limit_per_window,
            )
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "TALLY_API_BIND_ADDR", "127.0.0.1:8080");
        let api_token = required_trimmed(&lookup, "TALLY_API_TOKEN")?;
        let db_path = PathBuf::from(value_or_default(&lookup, "TALLY_DB_PATH", "tally-sync.db"));

        let entity_types = parse_entity_types(&value_or_default(
            &lookup,
            "TALLY_ENTITY_TYPES",
            "activity,habit,task",
        ))?;

        let max_pull_limit = value_or_default(&lookup, "SYNC_PULL_PAGE_LIMIT", "500")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "SYNC_PULL_PAGE_LIMIT must be an integer in [1, 1000]".to_string(),
                )
            })?;
        if !(1..=1_000).contains(&max_pull_limit) {
            return Err(ConfigError::Invalid(
                "SYNC_PULL_PAGE_LIMIT must be in [1, 1000]".to_string(),
            ));
        }

        let rate_limit_window_secs = value_or_default(&lookup, "RATE_LIMIT_WINDOW_SECS", "60")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "RATE_LIMIT_WINDOW_SECS must be an integer in [10, 3600]".to_string(),
                )
            })?;
        if !(10..=3_600).contains(&rate_limit_window_secs) {
            return Err(ConfigError::Invalid(
                "RATE_LIMIT_WINDOW_SECS must be in [10, 3600]".to_string(),
            ));
        }

        let push_rate_limit_per_window =
            value_or_default(&lookup, "SYNC_PUSH_RATE_LIMIT_PER_WINDOW", "120")
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "SYNC_PUSH_RATE_LIMIT_PER_WINDOW must be an integer in [1, 5000]"
                            .to_string(),
                    )
                })?;
        if !(1..=5_000).contains(&push_rate_limit_per_window) {
            return Err(ConfigError::Invalid(
                "SYNC_PUSH_RATE_LIMIT_PER_WINDOW must be in [1, 5000]".to_string(),
            ));
        }

        let pull_rate_limit_per_window =
            value_or_default(&lookup, "SYNC_PULL_RATE_LIMIT_PER_WINDOW", "240")
                .parse::<u32>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "SYNC_PULL_RATE_LIMIT_PER_WINDOW must be an integer in [1, 5000]"
                            .to_string(),
                    )
                })?;
        if !(1..=5_000).contains(&pull_rate_limit_per_window) {
            return Err(ConfigError::Invalid(
                "SYNC_PULL_RATE_LIMIT_PER_WINDOW must be in [1, 5000]".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            api_token,
            db_path,
            entity_types,
            max_pull_limit,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            push_rate_limit_per_window,
            pull_rate_limit_per_window,
        })
    }
}

fn parse_entity_types(raw: &str) -> Result<Vec<String>, ConfigError> {
    let types: Vec<String> = raw
        .split(',')
        .map(|part| part.trim().to_ascii_lowercase())
        .filter(|part| !part.is_empty())
        .collect();
    if types.is_empty() {
        return Err(ConfigError::Invalid(
            "TALLY_ENTITY_TYPES must name at least one entity type".to_string(),
        ));
    }
    Ok(types)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

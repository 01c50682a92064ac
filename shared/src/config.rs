//! Client configuration.
//!
//! Defaults point at a local backend. Hosts may deserialize a config file
//! or read `RIDE_*` environment variables; either way call `validate()`
//! before building a core.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::search::SearchSettings;
use crate::{
    DEFAULT_API_BASE_URL, DEFAULT_GEOCODER_URL, DEFAULT_SEARCH_DEBOUNCE, DEFAULT_STREAM_URL,
    GEOCODE_RESULT_LIMIT, HEARTBEAT_INTERVAL, MIN_QUERY_CHARS, REQUEST_TIMEOUT,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is not a valid URL: {reason}")]
    InvalidUrl { name: &'static str, reason: String },

    #[error("{name} must use one of {expected}, got '{found}'")]
    WrongScheme {
        name: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("{name} is not a number: '{value}'")]
    NotANumber { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub stream_url: String,
    pub geocoder_url: String,
    pub search_debounce_ms: u64,
    pub min_query_chars: usize,
    pub geocode_limit: usize,
    pub heartbeat_interval_secs: u64,
    pub request_timeout_ms: u64,
    /// Where the native shell keeps its SQLite file. `None` keeps state in memory.
    pub storage_path: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.into(),
            stream_url: DEFAULT_STREAM_URL.into(),
            geocoder_url: DEFAULT_GEOCODER_URL.into(),
            search_debounce_ms: duration_ms(DEFAULT_SEARCH_DEBOUNCE),
            min_query_chars: MIN_QUERY_CHARS,
            geocode_limit: GEOCODE_RESULT_LIMIT,
            heartbeat_interval_secs: HEARTBEAT_INTERVAL.as_secs(),
            request_timeout_ms: duration_ms(REQUEST_TIMEOUT),
            storage_path: None,
        }
    }
}

fn duration_ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl ClientConfig {
    /// Defaults overridden by `RIDE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with an injectable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("RIDE_API_URL") {
            config.api_base_url = v;
        }
        if let Some(v) = lookup("RIDE_STREAM_URL") {
            config.stream_url = v;
        }
        if let Some(v) = lookup("RIDE_GEOCODER_URL") {
            config.geocoder_url = v;
        }
        if let Some(v) = lookup("RIDE_SEARCH_DEBOUNCE_MS") {
            config.search_debounce_ms = number("RIDE_SEARCH_DEBOUNCE_MS", &v)?;
        }
        if let Some(v) = lookup("RIDE_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = number("RIDE_HEARTBEAT_SECS", &v)?;
        }
        if let Some(v) = lookup("RIDE_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = number("RIDE_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("RIDE_STORAGE_PATH").filter(|v| !v.is_empty()) {
            config.storage_path = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("api_base_url", &self.api_base_url, &["http", "https"])?;
        check_url("stream_url", &self.stream_url, &["ws", "wss"])?;
        check_url("geocoder_url", &self.geocoder_url, &["http", "https"])?;

        for (name, value) in [
            ("search_debounce_ms", self.search_debounce_ms),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        if self.min_query_chars == 0 {
            return Err(ConfigError::Zero {
                name: "min_query_chars",
            });
        }
        if self.geocode_limit == 0 {
            return Err(ConfigError::Zero {
                name: "geocode_limit",
            });
        }
        Ok(())
    }

    /// Parsed stream endpoint. Only meaningful after `validate()`.
    pub fn stream_endpoint(&self) -> Result<Url, ConfigError> {
        check_url("stream_url", &self.stream_url, &["ws", "wss"])
    }

    #[must_use]
    pub fn heartbeat_ms(&self) -> u64 {
        self.heartbeat_interval_secs.saturating_mul(1000)
    }

    #[must_use]
    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            geocoder_url: self.geocoder_url.clone(),
            debounce_ms: self.search_debounce_ms,
            min_query_chars: self.min_query_chars,
            result_limit: self.geocode_limit,
        }
    }
}

fn number(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::NotANumber {
        name,
        value: value.to_string(),
    })
}

fn check_url(name: &'static str, raw: &str, schemes: &[&'static str]) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        name,
        reason: e.to_string(),
    })?;
    if !schemes.iter().any(|s| *s == url.scheme()) {
        return Err(ConfigError::WrongScheme {
            name,
            expected: if schemes.contains(&"ws") { "ws, wss" } else { "http, https" },
            found: url.scheme().to_string(),
        });
    }
    Ok(url)
}

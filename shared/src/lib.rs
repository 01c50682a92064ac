#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod api;
pub mod app;
pub mod auth;
pub mod capabilities;
pub mod config;
pub mod event;
pub mod model;
pub mod ride;
pub mod search;
pub mod storage;
pub mod stream;

#[cfg(feature = "native")]
pub mod shell;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub use app::{App, Core, Model, ViewModel};
pub use capabilities::{Capabilities, Effect};
pub use config::{ClientConfig, ConfigError};
pub use event::{BackendEvent, Event};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8081/api/v1";
pub const DEFAULT_STREAM_URL: &str = "ws://localhost:8081/api/v1/driver/stream";
pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_SEARCH_DEBOUNCE: Duration = Duration::from_millis(500);
pub const MIN_QUERY_CHARS: usize = 3;
pub const GEOCODE_RESULT_LIMIT: usize = 5;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const FINISHED_TRIP_ZOOM: f64 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    SessionExpired,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    Storage,
    Serialization,
    Location,
    Stream,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Location => "LOCATION_ERROR",
            Self::Stream => "STREAM_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::Conflict
            | Self::RateLimited
            | Self::Storage
            | Self::Location
            | Self::Stream => ErrorSeverity::Transient,

            Self::Serialization | Self::Internal => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::SessionExpired
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::InvalidState
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Storage | Self::Stream
        )
    }

    #[must_use]
    pub const fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::Validation,
            401 => Self::Authentication,
            403 => Self::Authorization,
            404 => Self::NotFound,
            408 => Self::Timeout,
            409 => Self::Conflict,
            429 => Self::RateLimited,
            500..=599 => Self::Internal,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    /// Text for a toast. Server-provided messages are shown as-is for the
    /// kinds where the backend explains the problem better than we can.
    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::SessionExpired => "Your session has expired. Please sign in again.".into(),
            ErrorKind::Authorization => {
                "You don't have permission to perform this action.".into()
            }
            ErrorKind::RateLimited => "Too many requests. Please wait a moment and try again.".into(),
            ErrorKind::Storage => "Unable to save data on this device.".into(),
            ErrorKind::Serialization => {
                "The server sent an unexpected response. Please try again later.".into()
            }
            ErrorKind::Authentication
            | ErrorKind::Validation
            | ErrorKind::NotFound
            | ErrorKind::Conflict
            | ErrorKind::Location
            | ErrorKind::Stream
            | ErrorKind::InvalidState => self.message.clone(),
            ErrorKind::Internal | ErrorKind::Unknown => {
                if self.message.is_empty() {
                    "An unexpected error occurred. Please try again.".into()
                } else {
                    self.message.clone()
                }
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

impl From<CoordinateError> for AppError {
    fn from(e: CoordinateError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

/// A user action that is not valid right now. Rejected before any effect
/// is emitted and before any state is touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PreconditionError {
    #[error("Please sign in first")]
    NotSignedIn,
    #[error("Choose a pickup location")]
    MissingPickup,
    #[error("Choose a destination")]
    MissingDestination,
    #[error("Choose a ride option")]
    NoFareSelected,
    #[error("That ride option is no longer available")]
    UnknownFare,
    #[error("No search result at position {0}")]
    UnknownResult(usize),
    #[error("Please wait for the current request to finish")]
    RequestInFlight,
    #[error("Not available while {0}")]
    WrongStep(&'static str),
    #[error("Invalid location: {0}")]
    InvalidLocation(#[from] CoordinateError),
    #[error("Could not send the request: {0}")]
    RequestNotSent(String),
}

impl From<PreconditionError> for AppError {
    fn from(e: PreconditionError) -> Self {
        let kind = match e {
            PreconditionError::NotSignedIn => ErrorKind::Authentication,
            PreconditionError::WrongStep(_) | PreconditionError::RequestInFlight => {
                ErrorKind::InvalidState
            }
            PreconditionError::RequestNotSent(_) => ErrorKind::Internal,
            _ => ErrorKind::Validation,
        };
        AppError::new(kind, e.to_string())
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

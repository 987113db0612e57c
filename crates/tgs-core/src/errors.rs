use std::path::PathBuf;

/// Core error type for the scanner.
///
/// Adapter crates map their library errors into this type so the retry layer
/// can classify failures consistently (rate limit vs transient vs fatal).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("external error: {0}")]
    External(String),

    /// Server asked us to wait (Telegram flood wait / HTTP 429).
    #[error("rate limited: wait {seconds} seconds")]
    RateLimited { seconds: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("network connectivity failed after {attempts} attempts during {operation}: {last}")]
    NetworkConnectivity {
        operation: String,
        attempts: u32,
        last: Box<Error>,
    },

    #[error("{operation} failed after {attempts} attempts. Last error: {last}")]
    MaxRetriesExceeded {
        operation: String,
        attempts: u32,
        last: Box<Error>,
    },

    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How the retry layer treats a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Sleep for the server-provided number of seconds, then retry.
    RateLimit(u64),
    /// I/O or connection-class failure; retried with backoff and reported as
    /// `NetworkConnectivity` once exhausted.
    Network,
    /// Anything else; retried with backoff and reported as `MaxRetriesExceeded`.
    Transient,
    /// Never retried; the caller has to re-authenticate.
    SessionExpired,
    /// Never retried (credentials, permissions, already-exhausted retries).
    Fatal,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::RateLimited { seconds } => ErrorClass::RateLimit(*seconds),
            Error::Io(_) | Error::Network(_) | Error::Timeout(_) => ErrorClass::Network,
            Error::SessionExpired(_) => ErrorClass::SessionExpired,
            Error::InvalidCredentials(_)
            | Error::PermissionDenied(_)
            | Error::NetworkConnectivity { .. }
            | Error::MaxRetriesExceeded { .. } => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, Error::SessionExpired(_))
    }

    /// Stable short name used in operation logs and error statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "Config",
            Error::Io(_) => "Io",
            Error::Json(_) => "Json",
            Error::Csv(_) => "Csv",
            Error::InvalidPath { .. } => "InvalidPath",
            Error::External(_) => "External",
            Error::RateLimited { .. } => "RateLimited",
            Error::Network(_) => "Network",
            Error::Timeout(_) => "Timeout",
            Error::SessionExpired(_) => "SessionExpired",
            Error::InvalidCredentials(_) => "InvalidCredentials",
            Error::PermissionDenied(_) => "PermissionDenied",
            Error::NetworkConnectivity { .. } => "NetworkConnectivity",
            Error::MaxRetriesExceeded { .. } => "MaxRetriesExceeded",
            Error::UnsupportedFormat(_) => "UnsupportedFormat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_retry_tiers() {
        assert_eq!(
            Error::RateLimited { seconds: 7 }.class(),
            ErrorClass::RateLimit(7)
        );
        assert_eq!(Error::Network("reset".into()).class(), ErrorClass::Network);
        assert_eq!(
            Error::External("weird".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            Error::SessionExpired("auth key".into()).class(),
            ErrorClass::SessionExpired
        );
        assert_eq!(
            Error::PermissionDenied("private".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn exhausted_retries_are_not_retried_again() {
        let err = Error::MaxRetriesExceeded {
            operation: "inner".into(),
            attempts: 4,
            last: Box::new(Error::External("boom".into())),
        };
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(err.to_string().contains("Last error: external error: boom"));
    }
}

//! Error types for drivetime-matrix
//!
//! Only faults that abort a run live here. Per-entity and per-pair failures
//! are recorded in the run report instead (see `core::report`).

use std::fmt;

use strsim::jaro_winkler;

/// Minimum Jaro-Winkler similarity for a "did you mean" suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.85;

/// Suggest the closest known name for a name that matched nothing.
///
/// Used for override-table entries that no longer match a live entity, which
/// usually means the club was renamed in the source spreadsheet.
pub fn suggest_name<'a, I>(input: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let input_lower = input.to_lowercase();
    let mut best: Option<(&str, f64)> = None;

    for candidate in candidates {
        let candidate_lower = candidate.to_lowercase();
        if candidate_lower == input_lower {
            // Exact match (ignoring case), nothing to suggest
            return None;
        }

        let score = jaro_winkler(&input_lower, &candidate_lower);
        if score >= SUGGESTION_THRESHOLD && best.map_or(true, |(_, s)| score > s) {
            best = Some((candidate, score));
        }
    }

    best.map(|(name, _)| name.to_string())
}

/// Main error type for drivetime-matrix operations
#[derive(Debug)]
pub enum Error {
    /// File I/O error
    IoError(std::io::Error),

    /// HTTP-level failure (bad status, unexpected payload)
    HttpError(String),

    /// Network connectivity issues (connect, timeout)
    NetworkError(String),

    /// The service refused the request (4xx other than 429)
    RequestRejected(String),

    /// Invalid entity data or parameters
    InvalidInput(String),

    /// Persisted or fetched data could not be decoded
    ParseError(String),

    /// Invalid configuration
    ConfigError(String),
}

impl Error {
    /// Whether a retry may succeed.
    ///
    /// Network faults and server-side HTTP failures are transient; everything
    /// else is a definitive answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NetworkError(_) | Error::HttpError(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {err}"),
            Error::HttpError(msg) => write!(f, "HTTP error: {msg}"),
            Error::NetworkError(msg) => write!(f, "Network error: {msg}"),
            Error::RequestRejected(msg) => write!(f, "Request rejected: {msg}"),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
            Error::ParseError(msg) => write!(f, "Parse error: {msg}"),
            Error::ConfigError(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::NetworkError(err.to_string())
        } else if err.is_decode() {
            // Truncated or garbled bodies are worth another attempt
            Error::HttpError(format!("undecodable response: {err}"))
        } else {
            Error::HttpError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::ConfigError(err.to_string())
    }
}

/// Convenience result type for drivetime-matrix operations
pub type Result<T> = std::result::Result<T, Error>;

//! Error handling module for build-sentinel.
//!
//! Provides a single error taxonomy shared by the checker, the worker layer and the
//! coordinator, with stable codes and a transient/permanent classification.

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const HTTP_STATUS: &str = "HTTP_STATUS";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const PERSISTENCE_ERROR: &str = "PERSISTENCE_ERROR";
    pub const WORKER_ERROR: &str = "WORKER_ERROR";
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    pub const UNSUPPORTED: &str = "UNSUPPORTED";
}

/// Errors produced while checking for, or reacting to, a new build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// Request never produced a response
    Network(String),
    /// Server answered with a non-2xx status
    HttpStatus { status: u16, url: String },
    /// Request or worker round-trip took too long
    Timeout(String),
    /// Descriptor body is malformed or incomplete
    Validation(String),
    /// State store read/write failure
    Persistence(String),
    /// Background worker rejected or failed a request
    Worker(String),
    /// Configuration rejected
    Config(String),
    /// Runtime lacks a required capability
    Unsupported(String),
}

impl CheckError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            CheckError::Network(_) => codes::NETWORK_ERROR,
            CheckError::HttpStatus { .. } => codes::HTTP_STATUS,
            CheckError::Timeout(_) => codes::TIMEOUT,
            CheckError::Validation(_) => codes::VALIDATION_ERROR,
            CheckError::Persistence(_) => codes::PERSISTENCE_ERROR,
            CheckError::Worker(_) => codes::WORKER_ERROR,
            CheckError::Config(_) => codes::CONFIG_ERROR,
            CheckError::Unsupported(_) => codes::UNSUPPORTED,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            CheckError::Network(msg) => msg.clone(),
            CheckError::HttpStatus { status, url } => {
                format!("{} returned HTTP {}", url, status)
            }
            CheckError::Timeout(msg) => msg.clone(),
            CheckError::Validation(msg) => msg.clone(),
            CheckError::Persistence(msg) => msg.clone(),
            CheckError::Worker(msg) => msg.clone(),
            CheckError::Config(msg) => msg.clone(),
            CheckError::Unsupported(msg) => msg.clone(),
        }
    }

    /// Whether another attempt could reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CheckError::Network(_) | CheckError::HttpStatus { .. } | CheckError::Timeout(_)
        )
    }
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for CheckError {}

impl From<reqwest::Error> for CheckError {
    fn from(err: reqwest::Error) -> Self {
        tracing::debug!("HTTP error: {:?}", err);
        if err.is_timeout() {
            CheckError::Timeout(format!("Request timed out: {}", err))
        } else if let Some(status) = err.status() {
            CheckError::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            CheckError::Network(format!("Request failed: {}", err))
        }
    }
}

impl From<sqlx::Error> for CheckError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        CheckError::Persistence(format!("Database error: {}", err))
    }
}

impl From<serde_json::Error> for CheckError {
    fn from(err: serde_json::Error) -> Self {
        CheckError::Persistence(format!("JSON error: {}", err))
    }
}

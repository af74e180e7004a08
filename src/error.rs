//! Error handling for the round miner
//!
//! One error type for every layer of the miner: configuration, the verification
//! table, device engines, the work source and the round coordinator. Each error
//! knows whether a retry can help, which drives the coordinator's fetch loop.

use thiserror::Error;

/// Result type alias for miner operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the miner
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Verification table errors
    #[error("Verification table error: {message}")]
    Table { message: String },

    /// Device initialization or search errors
    #[error("Device {device} error: {message}")]
    Device { device: usize, message: String },

    /// Every configured device failed to initialize
    #[error("No usable devices: {message}")]
    NoDevices { message: String },

    /// Transport-level work source failures
    #[error("Work source error: {message}")]
    WorkSource { message: String },

    /// The remote service answered with a JSON-RPC error object
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The remote service answered with work we cannot use
    #[error("Malformed work: {message}")]
    MalformedWork { message: String },

    /// The remote service rejected a solution
    #[error("Solution rejected: {message}")]
    Submission { message: String },

    /// A worker stopped without reporting back to the coordinator
    #[error("Worker for device {device} was lost: {message}")]
    WorkerLost { device: usize, message: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a verification table error
    pub fn table(message: impl Into<String>) -> Self {
        Self::Table {
            message: message.into(),
        }
    }

    /// Create a device error
    pub fn device(device: usize, message: impl Into<String>) -> Self {
        Self::Device {
            device,
            message: message.into(),
        }
    }

    /// Create a no-devices error
    pub fn no_devices(message: impl Into<String>) -> Self {
        Self::NoDevices {
            message: message.into(),
        }
    }

    /// Create a work source error
    pub fn work_source(message: impl Into<String>) -> Self {
        Self::WorkSource {
            message: message.into(),
        }
    }

    /// Create an RPC error
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Create a malformed work error
    pub fn malformed_work(message: impl Into<String>) -> Self {
        Self::MalformedWork {
            message: message.into(),
        }
    }

    /// Create a submission error
    pub fn submission(message: impl Into<String>) -> Self {
        Self::Submission {
            message: message.into(),
        }
    }

    /// Create a lost worker error
    pub fn worker_lost(device: usize, message: impl Into<String>) -> Self {
        Self::WorkerLost {
            device,
            message: message.into(),
        }
    }

    /// Check if a failed fetch is worth retrying as-is
    ///
    /// Malformed work and configuration problems are not transient: the fetch
    /// loop still goes around again, but logs them as errors instead of warnings.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                } else {
                    e.is_timeout() || e.is_connect() || e.is_request()
                }
            }
            Error::Io(_) => true,
            Error::WorkSource { .. } => true,
            Error::Rpc { .. } => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Config { .. } => "config",
            Error::Table { .. } => "table",
            Error::Device { .. } => "device",
            Error::NoDevices { .. } => "no_devices",
            Error::WorkSource { .. } => "work_source",
            Error::Rpc { .. } => "rpc",
            Error::MalformedWork { .. } => "malformed_work",
            Error::Submission { .. } => "submission",
            Error::WorkerLost { .. } => "worker_lost",
        }
    }
}

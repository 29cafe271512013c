//! Error handling for the Handshake mining client
//!
//! Codec failures, work validation failures, and runtime failures of the
//! RPC transport and compute backends share one error type. Whether an error
//! ends the process or only the current tick is decided by [`Error::is_fatal`].

use thiserror::Error;

/// Result type alias for mining operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the mining client
#[derive(Error, Debug)]
pub enum Error {
    /// Compact bits of zero
    #[error("Invalid target.")]
    InvalidTarget,

    /// Compact bits with the mantissa sign bit set
    #[error("Negative target.")]
    NegativeTarget,

    /// Compact bits whose mantissa does not fit in 32 bytes
    #[error("Target overflowed.")]
    TargetOverflow,

    /// Header buffer of the wrong size
    #[error("Bad header size: {message}")]
    BadHeaderSize { message: String },

    /// Target of the wrong size
    #[error("Bad target size: {message}")]
    BadTargetSize { message: String },

    /// Height outside the u32 range
    #[error("Bad height: {message}")]
    BadHeight { message: String },

    /// Time outside the u32 range, or a header time with a non-zero guard
    #[error("Bad time: {message}")]
    BadTime { message: String },

    /// Work source serves a different network
    #[error("Wrong network: {actual} (expected {expected})")]
    WrongNetwork { expected: String, actual: String },

    /// Malformed work source response
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// JSON-RPC error object returned by the node
    #[error("RPC error: {message} {code}")]
    Rpc { message: String, code: i64 },

    /// HTTP 401 from the node
    #[error("Unauthorized (bad API key).")]
    Unauthorized,

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

    /// Compute backend failures
    #[error("Backend error: {backend}: {message}")]
    Backend { backend: String, message: String },

    /// A device already runs a job
    #[error("Job already in progress on device {device}")]
    JobInProgress { device: u32 },

    /// Device index out of range
    #[error("No such device: {device}")]
    NoDevice { device: u32 },

    /// Backend name not compiled in or unknown
    #[error("Backend {name} not supported!")]
    UnsupportedBackend { name: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },
}

impl Error {
    /// Create a header size error
    pub fn bad_header_size(message: impl Into<String>) -> Self {
        Self::BadHeaderSize {
            message: message.into(),
        }
    }

    /// Create a target size error
    pub fn bad_target_size(message: impl Into<String>) -> Self {
        Self::BadTargetSize {
            message: message.into(),
        }
    }

    /// Create a height error
    pub fn bad_height(message: impl Into<String>) -> Self {
        Self::BadHeight {
            message: message.into(),
        }
    }

    /// Create a time error
    pub fn bad_time(message: impl Into<String>) -> Self {
        Self::BadTime {
            message: message.into(),
        }
    }

    /// Create a network mismatch error
    pub fn wrong_network(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::WrongNetwork {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an RPC error
    pub fn rpc(message: impl Into<String>, code: i64) -> Self {
        Self::Rpc {
            message: message.into(),
            code,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a backend error
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(name: impl Into<String>) -> Self {
        Self::UnsupportedBackend { name: name.into() }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Errors that must end the process rather than the current tick
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::WrongNetwork { .. } | Error::UnsupportedBackend { .. } | Error::Config { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidTarget | Error::NegativeTarget | Error::TargetOverflow => "target",
            Error::BadHeaderSize { .. } => "header",
            Error::BadTargetSize { .. }
            | Error::BadHeight { .. }
            | Error::BadTime { .. }
            | Error::Protocol { .. } => "protocol",
            Error::WrongNetwork { .. } => "network",
            Error::Rpc { .. } | Error::Unauthorized => "rpc",
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Config { .. } => "config",
            Error::Backend { .. }
            | Error::JobInProgress { .. }
            | Error::NoDevice { .. }
            | Error::UnsupportedBackend { .. } => "backend",
            Error::Timeout { .. } => "timeout",
        }
    }
}

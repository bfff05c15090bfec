//! Error types for ozonewatch
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Retry classification for the delivery loop
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::PeerId;

/// Result type alias for ozonewatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    BindFailed = 302,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,
    EncodeFailed = 402,

    // Delivery errors (5xx)
    DeliveryRejected = 500,
    QueueClosed = 501,

    // Registry errors (6xx)
    UnknownPeer = 600,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Delivery errors
            600..=699 => 60, // Registry errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Could not reach an endpoint
    #[error("Failed to reach {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    /// Request timed out
    #[error("Request to {endpoint} timed out")]
    ConnectionTimeout { endpoint: String },

    /// Listener could not bind
    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Inbound envelope could not be decoded
    #[error("Malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),

    /// Outbound envelope could not be encoded
    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Delivery Errors
    // ─────────────────────────────────────────────────────────────

    /// Endpoint answered with a non-success status
    #[error("Delivery to {endpoint} rejected with status {status}")]
    DeliveryRejected { endpoint: String, status: u16 },

    /// The delivery queue has been shut down
    #[error("Delivery queue for {endpoint} is closed")]
    QueueClosed { endpoint: String },

    // ─────────────────────────────────────────────────────────────
    // Registry Errors
    // ─────────────────────────────────────────────────────────────

    /// Location update for a peer that was never registered
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::Connection { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::Bind { .. } => ErrorCode::BindFailed,

            Error::Decode(_) => ErrorCode::ProtocolMalformed,
            Error::Encode(_) => ErrorCode::EncodeFailed,

            Error::DeliveryRejected { .. } => ErrorCode::DeliveryRejected,
            Error::QueueClosed { .. } => ErrorCode::QueueClosed,

            Error::UnknownPeer(_) => ErrorCode::UnknownPeer,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the delivery loop should retry after this error.
    ///
    /// Every transport-side failure counts, including encoding: there is
    /// no permanent-failure class on the outbound path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::ConnectionTimeout { .. }
                | Error::DeliveryRejected { .. }
                | Error::Encode(_)
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (process should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
                | Error::Bind { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'ozonewatch config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'ozonewatch config validate' to see details."
            ),
            Error::ConfigValidation { .. } | Error::Config(_) => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::Bind { .. } => Some(
                "Another process may already use this port. Change 'listen_addr' or 'base_port'."
            ),
            Error::Connection { .. } | Error::ConnectionTimeout { .. } => Some(
                "The peer may be offline. Delivery will be retried automatically."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection error
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a rejected-delivery error
    pub fn delivery_rejected(endpoint: impl Into<String>, status: u16) -> Self {
        Error::DeliveryRejected {
            endpoint: endpoint.into(),
            status,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

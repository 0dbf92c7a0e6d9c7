//! Error types for the serial protocol engine.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use ublock::{Connection, ConnectionOptions, Result};
//!
//! async fn example() -> Result<()> {
//!     let connection = Connection::open("/dev/ttyACM0", ConnectionOptions::new()).await?;
//!     connection.write("X").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::DuplicateName`], [`Error::InvalidArgument`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::NotConnected`] |
//! | Caller state | [`Error::AlreadyPending`], [`Error::AlreadyRunning`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::Url`], [`Error::Serial`] |
//!
//! Token-level parse failures inside a result message are not part of this
//! enum: they are [`TokenError`]s, logged and recovered locally by the parser.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::num::ParseIntError;
use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when options or name sets are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// The same result name was declared in more than one category.
    #[error("Duplicate result name '{name}': declared as {first} and {second}")]
    DuplicateName {
        /// The offending name.
        name: String,
        /// Category of the first declaration.
        first: &'static str,
        /// Category of the conflicting declaration.
        second: &'static str,
    },

    /// Invalid argument passed by the caller.
    ///
    /// Returned e.g. for commands that are not plain ASCII lines.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// The link could not be opened.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// The device never became ready within the configured timeout.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// A write was attempted while the connection is not open.
    #[error("Not connected")]
    NotConnected,

    // ========================================================================
    // Caller State Errors
    // ========================================================================
    /// A repeatable-action request is already outstanding.
    #[error("Request already pending: {command}")]
    AlreadyPending {
        /// Command of the outstanding request.
        command: String,
    },

    /// A loop run is already active (or finished and not reset).
    #[error("Loop already running: {command}")]
    AlreadyRunning {
        /// Command of the loop.
        command: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Address could not be parsed as a URL.
    #[error("Address error: {0}")]
    Url(#[from] url::ParseError),

    /// Serial port error.
    #[error("Serial error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a duplicate name error.
    #[inline]
    pub fn duplicate_name(name: impl Into<String>, first: &'static str, second: &'static str) -> Self {
        Self::DuplicateName {
            name: name.into(),
            first,
            second,
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an already-pending error.
    #[inline]
    pub fn already_pending(command: impl Into<String>) -> Self {
        Self::AlreadyPending {
            command: command.into(),
        }
    }

    /// Creates an already-running error.
    #[inline]
    pub fn already_running(command: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            command: command.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::NotConnected
                | Self::Serial(_)
        )
    }

    /// Returns `true` if the caller tried to start something already active.
    #[inline]
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::AlreadyPending { .. } | Self::AlreadyRunning { .. })
    }

    /// Returns `true` if this is a configuration error.
    #[inline]
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::DuplicateName { .. } | Self::InvalidArgument { .. }
        )
    }
}

// ============================================================================
// TokenError
// ============================================================================

/// A malformed numeric suffix inside one result element.
///
/// Never returned to callers: the parser logs it and drops the element.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// A value element whose suffix is not an integer.
    #[error("error while parsing value '{name}': {element} ({source})")]
    Value {
        /// Value name that matched the prefix.
        name: String,
        /// The whole element.
        element: String,
        /// Integer conversion failure.
        source: ParseIntError,
    },

    /// An array element with an entry that is not an integer.
    #[error("error while parsing array '{name}': {element} ({source})")]
    Array {
        /// Array name that matched the prefix.
        name: String,
        /// The whole element.
        element: String,
        /// Integer conversion failure.
        source: ParseIntError,
    },
}

// ============================================================================
// Tests
// ============================================================================

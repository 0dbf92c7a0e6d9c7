//! Connection configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use ublock::{ConnectionOptions, ReadyPolicy};
//!
//! let options = ConnectionOptions::new()
//!     .with_baud_rate(115_200)
//!     .with_ready(ReadyPolicy::handshake("?"))
//!     .with_ready_timeout(Duration::from_secs(5));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::protocol::LINE_TERMINATOR;

// ============================================================================
// Constants
// ============================================================================

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default idle time after which a blocked read is retried.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Default limit on inbound line length, in bytes, excluding the newline.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

// ============================================================================
// ReadyPolicy
// ============================================================================

/// How a connection decides the device is ready for commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadyPolicy {
    /// Ready as soon as the link is open.
    #[default]
    Immediate,

    /// Ready as soon as the link is open; then send this command first.
    Handshake(String),

    /// Ready once the device sends its first line.
    FirstLine,
}

impl ReadyPolicy {
    /// Creates a handshake policy.
    #[inline]
    #[must_use]
    pub fn handshake(command: impl Into<String>) -> Self {
        Self::Handshake(command.into())
    }
}

// ============================================================================
// ConnectionOptions
// ============================================================================

/// Link and protocol options for a [`Connection`](super::Connection).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Serial baud rate (ignored for TCP links).
    pub baud_rate: u32,

    /// Appended to every outbound command.
    pub line_terminator: String,

    /// Idle time after which a blocked read is retried.
    #[serde(rename = "readTimeoutMs", deserialize_with = "millis")]
    pub read_timeout: Duration,

    /// Longer inbound lines are discarded.
    pub max_line_length: usize,

    /// Readiness policy.
    pub ready: ReadyPolicy,

    /// If set, `open` waits this long for the device to become ready.
    #[serde(rename = "readyTimeoutMs", deserialize_with = "optional_millis")]
    pub ready_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            line_terminator: LINE_TERMINATOR.to_string(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            ready: ReadyPolicy::Immediate,
            ready_timeout: None,
        }
    }

    /// Loads options from JSON, e.g. `{"baudRate": 115200, "ready": "firstLine"}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input, or [`Error::Config`] if
    /// the result does not validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ConnectionOptions {
    /// Sets the baud rate.
    #[inline]
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Sets the outbound line terminator.
    #[inline]
    #[must_use]
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Sets the read retry timeout.
    #[inline]
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the inbound line length limit.
    #[inline]
    #[must_use]
    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    /// Sets the readiness policy.
    #[inline]
    #[must_use]
    pub fn with_ready(mut self, ready: ReadyPolicy) -> Self {
        self.ready = ready;
        self
    }

    /// Makes `open` wait for readiness.
    #[inline]
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ConnectionOptions {
    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero baud rate, read timeout or line
    /// length limit, or a terminator that does not end in a line break.
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(Error::config("baud rate must be greater than zero"));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::config("read timeout must be greater than zero"));
        }
        if self.max_line_length == 0 {
            return Err(Error::config("max line length must be greater than zero"));
        }
        if !self.line_terminator.ends_with('\n') && !self.line_terminator.ends_with('\r') {
            return Err(Error::config(format!(
                "line terminator must end in a line break, got {:?}",
                self.line_terminator
            )));
        }
        if let ReadyPolicy::Handshake(command) = &self.ready
            && command.is_empty()
        {
            return Err(Error::config("handshake command must not be empty"));
        }
        Ok(())
    }
}

// ============================================================================
// Serde Helpers
// ============================================================================

/// Deserializes a duration given in milliseconds.
pub(crate) fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Deserializes an optional duration given in milliseconds.
pub(crate) fn optional_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_creates_default() {
        let options = ConnectionOptions::new();
        assert_eq!(options.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(options.line_terminator, "\n");
        assert_eq!(options.read_timeout, DEFAULT_READ_TIMEOUT);
        assert_eq!(options.max_line_length, DEFAULT_MAX_LINE_LENGTH);
        assert_eq!(options.ready, ReadyPolicy::Immediate);
        assert!(options.ready_timeout.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let options = ConnectionOptions::new()
            .with_baud_rate(115_200)
            .with_line_terminator("\r\n")
            .with_ready(ReadyPolicy::handshake("?"))
            .with_ready_timeout(Duration::from_secs(2));

        assert_eq!(options.baud_rate, 115_200);
        assert_eq!(options.line_terminator, "\r\n");
        assert_eq!(options.ready, ReadyPolicy::Handshake("?".into()));
        assert_eq!(options.ready_timeout, Some(Duration::from_secs(2)));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_baud() {
        assert!(ConnectionOptions::new().with_baud_rate(0).validate().is_err());
    }

    #[test]
    fn test_validate_zero_line_length() {
        assert!(ConnectionOptions::new().with_max_line_length(0).validate().is_err());
    }

    #[test]
    fn test_validate_bad_terminator() {
        let options = ConnectionOptions::new().with_line_terminator(";");
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_empty_handshake() {
        let options = ConnectionOptions::new().with_ready(ReadyPolicy::handshake(""));
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_from_json() {
        let options = ConnectionOptions::from_json(
            r#"{"baudRate": 115200, "readTimeoutMs": 250, "maxLineLength": 256, "ready": "firstLine", "readyTimeoutMs": 3000}"#,
        )
        .expect("valid options");

        assert_eq!(options.baud_rate, 115_200);
        assert_eq!(options.read_timeout, Duration::from_millis(250));
        assert_eq!(options.max_line_length, 256);
        assert_eq!(options.ready, ReadyPolicy::FirstLine);
        assert_eq!(options.ready_timeout, Some(Duration::from_secs(3)));
        assert_eq!(options.line_terminator, "\n");
    }

    #[test]
    fn test_from_json_handshake() {
        let options = ConnectionOptions::from_json(r#"{"ready": {"handshake": "?"}}"#)
            .expect("valid options");
        assert_eq!(options.ready, ReadyPolicy::handshake("?"));
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(ConnectionOptions::from_json(r#"{"baudRate": 0}"#).is_err());
    }
}

//! Events raised by a connection.
//!
//! Events are delivered to subscribers on the connection's event loop, in
//! the order the underlying lines were received.
//!
//! # Event Types
//!
//! | Group | Events |
//! |-------|--------|
//! | Inbound lines | `LineReceived`, `Debug`, `Info`, `Config`, `ConfigElement`, `Result`, `ResultElement`, `Error`, `Output` |
//! | Requests | `RequestPending`, `RequestIdle`, `RequestAbandoned` |
//! | Lifecycle | `StateChanged`, `Closed` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::Serialize;

use super::{Message, MessageKind};

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No link, or the link has been released.
    Closed,
    /// Link acquired, waiting for the device to become ready.
    Opening,
    /// Ready for writes.
    Open,
}

impl ConnectionState {
    /// Returns `true` if writes are accepted.
    #[inline]
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Event
// ============================================================================

/// A notification raised by a [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Event {
    /// Any non-empty inbound line, raised before its kind-specific event.
    LineReceived(String),

    /// Body of a `.` line.
    Debug(String),

    /// Body of a `>` line.
    Info(String),

    /// Body of an `@` line.
    Config(String),

    /// One element of an `@` line, after the `Config` event.
    ConfigElement(String),

    /// Body of a `+` line.
    Result(String),

    /// One element of a `+` line, after the `Result` event.
    ResultElement(String),

    /// Body of a `*` line.
    Error(String),

    /// Body of a `<` line.
    Output(String),

    /// The connection state changed.
    StateChanged(ConnectionState),

    /// A repeatable action was dispatched and awaits its response.
    RequestPending {
        /// The dispatched command.
        command: String,
    },

    /// The pending request was resolved by a response.
    RequestIdle,

    /// The pending request was dropped because the connection closed.
    RequestAbandoned,

    /// The link was released.
    Closed {
        /// Why the link ended, if not by request.
        reason: Option<String>,
    },
}

impl Event {
    /// Builds the kind-specific event for a classified body.
    ///
    /// Returns `None` for [`MessageKind::Plain`], which has no event of its own.
    #[must_use]
    pub fn for_message(kind: MessageKind, body: &str) -> Option<Self> {
        let body = body.to_string();
        match kind {
            MessageKind::Debug => Some(Self::Debug(body)),
            MessageKind::Info => Some(Self::Info(body)),
            MessageKind::Config => Some(Self::Config(body)),
            MessageKind::Result => Some(Self::Result(body)),
            MessageKind::Error => Some(Self::Error(body)),
            MessageKind::Output => Some(Self::Output(body)),
            MessageKind::Plain => None,
        }
    }

    /// Builds the per-element event for a classified kind.
    #[must_use]
    pub fn for_element(kind: MessageKind, element: &str) -> Option<Self> {
        match kind {
            MessageKind::Config => Some(Self::ConfigElement(element.to_string())),
            MessageKind::Result => Some(Self::ResultElement(element.to_string())),
            _ => None,
        }
    }

    /// Returns the classified message carried by a kind-specific event.
    #[must_use]
    pub fn message(&self) -> Option<Message> {
        let (kind, body) = match self {
            Self::Debug(body) => (MessageKind::Debug, body),
            Self::Info(body) => (MessageKind::Info, body),
            Self::Config(body) => (MessageKind::Config, body),
            Self::Result(body) => (MessageKind::Result, body),
            Self::Error(body) => (MessageKind::Error, body),
            Self::Output(body) => (MessageKind::Output, body),
            _ => return None,
        };
        Some(Message::new(kind, body.as_str()))
    }
}

// ============================================================================
// Tests
// ============================================================================

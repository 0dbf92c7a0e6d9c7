//! Message kinds and classified messages.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{CONFIG, DEBUG, ERROR, INFO, OUTPUT, RESULT};

// ============================================================================
// MessageKind
// ============================================================================

/// Kind of an inbound line, determined by its leading sigil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// `.` diagnostic output.
    Debug,
    /// `>` informational output.
    Info,
    /// `@` configuration report, `;`-delimited.
    Config,
    /// `+` trial result, `;`-delimited.
    Result,
    /// `*` device-side error.
    Error,
    /// `<` free-form output.
    Output,
    /// No recognized sigil.
    Plain,
}

impl MessageKind {
    /// All kinds that carry a sigil, in table order.
    pub const SIGILED: [MessageKind; 6] = [
        MessageKind::Debug,
        MessageKind::Info,
        MessageKind::Config,
        MessageKind::Result,
        MessageKind::Error,
        MessageKind::Output,
    ];

    /// Returns the sigil for this kind, or `None` for [`MessageKind::Plain`].
    #[inline]
    #[must_use]
    pub const fn sigil(self) -> Option<char> {
        match self {
            Self::Debug => Some(DEBUG),
            Self::Info => Some(INFO),
            Self::Config => Some(CONFIG),
            Self::Result => Some(RESULT),
            Self::Error => Some(ERROR),
            Self::Output => Some(OUTPUT),
            Self::Plain => None,
        }
    }

    /// Looks up the kind for a leading character.
    #[inline]
    #[must_use]
    pub const fn from_sigil(c: char) -> Option<Self> {
        match c {
            DEBUG => Some(Self::Debug),
            INFO => Some(Self::Info),
            CONFIG => Some(Self::Config),
            RESULT => Some(Self::Result),
            ERROR => Some(Self::Error),
            OUTPUT => Some(Self::Output),
            _ => None,
        }
    }

    /// Returns `true` if bodies of this kind are split into elements.
    #[inline]
    #[must_use]
    pub const fn has_elements(self) -> bool {
        matches!(self, Self::Config | Self::Result)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Config => "config",
            Self::Result => "result",
            Self::Error => "error",
            Self::Output => "output",
            Self::Plain => "plain",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Message
// ============================================================================

/// A classified line with its sigil stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Kind of the line.
    pub kind: MessageKind,
    /// Body without the sigil.
    pub body: String,
}

impl Message {
    /// Creates a message.
    #[inline]
    #[must_use]
    pub fn new(kind: MessageKind, body: impl Into<String>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// Classifies a raw line into a message.
    #[must_use]
    pub fn classify(line: &str) -> Self {
        let (kind, body) = super::classify(line);
        Self::new(kind, body)
    }
}

// ============================================================================
// ReturnKind
// ============================================================================

/// Which message kind terminates a repeatable action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnKind {
    /// Resolved by the next `+` message.
    #[default]
    Result,
    /// Resolved by the next `@` message.
    Config,
}

impl ReturnKind {
    /// Returns `true` if a message of `kind` resolves this return kind.
    #[inline]
    #[must_use]
    pub const fn matches(self, kind: MessageKind) -> bool {
        matches!(
            (self, kind),
            (Self::Result, MessageKind::Result) | (Self::Config, MessageKind::Config)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

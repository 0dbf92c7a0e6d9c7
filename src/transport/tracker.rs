//! Pending-request tracking for repeatable actions.
//!
//! At most one request is outstanding per connection. The tracker is owned
//! by the connection and mutated only on its event loop; callers observe it
//! through [`Connection::is_pending`](super::Connection::is_pending).

// ============================================================================
// Imports
// ============================================================================

use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::{MessageKind, ReturnKind};

// ============================================================================
// PendingRequest
// ============================================================================

/// The outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRequest {
    command: String,
    returns: ReturnKind,
}

// ============================================================================
// RequestTracker
// ============================================================================

/// Tracks at most one pending request.
#[derive(Debug, Default)]
pub struct RequestTracker {
    pending: Option<PendingRequest>,
}

impl RequestTracker {
    /// Creates an idle tracker.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `command` as pending until a message of kind `returns` arrives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyPending`] if a request is outstanding; the
    /// tracker is left unchanged.
    pub fn begin(&mut self, command: &str, returns: ReturnKind) -> Result<()> {
        if let Some(pending) = &self.pending {
            return Err(Error::already_pending(pending.command.clone()));
        }
        trace!(command, ?returns, "Request pending");
        self.pending = Some(PendingRequest {
            command: command.to_string(),
            returns,
        });
        Ok(())
    }

    /// Resolves the pending request if `kind` is its declared return kind.
    ///
    /// Returns `true` if the tracker went from pending to idle.
    pub fn resolve(&mut self, kind: MessageKind) -> bool {
        let matched = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.returns.matches(kind));
        if matched {
            self.pending = None;
        }
        matched
    }

    /// Drops the pending request without a response.
    ///
    /// Returns `true` if a request was pending.
    pub fn abandon(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Returns `true` if a request is outstanding.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns the outstanding command, if any.
    #[must_use]
    pub fn pending_command(&self) -> Option<&str> {
        self.pending.as_ref().map(|pending| pending.command.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================

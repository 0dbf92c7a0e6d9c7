//! Task mode selection.
//!
//! Each mode is selected by a one-character command. The device reports
//! its mode as a config element listing every mode command, with the
//! current one in brackets: `[P]T` while in `P`, `P[T]` while in `T`.
//!
//! A selection is provisional until the device reports it back. An error
//! message received meanwhile reverts to the last reported mode.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::SubscriptionId;
use crate::protocol::Event;
use crate::transport::Connection;

// ============================================================================
// ModeEntry
// ============================================================================

/// One task mode and the command that selects it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModeEntry {
    /// Display name.
    pub name: String,
    /// Single-character command, e.g. `P`.
    pub command: char,
}

impl ModeEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(name: impl Into<String>, command: char) -> Self {
        Self {
            name: name.into(),
            command,
        }
    }
}

// ============================================================================
// ModeReadback
// ============================================================================

#[derive(Debug, Default)]
struct Selection {
    /// Mode shown as current, possibly not yet confirmed.
    current: Option<usize>,
    /// Last mode the device reported.
    confirmed: Option<usize>,
    /// A selection awaits the device's report.
    changing: bool,
}

/// Tracks the device's task mode and selects new ones.
#[derive(Debug)]
pub struct ModeReadback {
    modes: Vec<ModeEntry>,
    selection: Mutex<Selection>,
}

impl ModeReadback {
    /// Creates a readback with no mode reported yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if there are no modes or a name or command
    /// repeats. Names must be non-empty; commands must be printable ASCII
    /// other than `[` and `]`.
    pub fn new(modes: impl IntoIterator<Item = ModeEntry>) -> Result<Self> {
        let modes: Vec<ModeEntry> = modes.into_iter().collect();
        if modes.is_empty() {
            return Err(Error::config("at least one mode is required"));
        }
        for (index, mode) in modes.iter().enumerate() {
            if mode.name.is_empty() {
                return Err(Error::config(format!("mode needs a name: {mode:?}")));
            }
            if !mode.command.is_ascii_graphic() || matches!(mode.command, '[' | ']') {
                return Err(Error::config(format!(
                    "invalid command {:?} for mode '{}'",
                    mode.command, mode.name
                )));
            }
            let earlier = &modes[..index];
            if earlier.iter().any(|other| other.name == mode.name) {
                return Err(Error::config(format!("mode '{}' declared twice", mode.name)));
            }
            if let Some(other) = earlier.iter().find(|other| other.command == mode.command) {
                return Err(Error::config(format!(
                    "modes '{}' and '{}' share command {:?}",
                    other.name, mode.name, mode.command
                )));
            }
        }

        Ok(Self {
            modes,
            selection: Mutex::new(Selection::default()),
        })
    }

    /// Loads modes from a JSON array of `{"name": ..., "command": ...}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input, or any error of
    /// [`new`](Self::new).
    pub fn from_json(json: &str) -> Result<Self> {
        let modes: Vec<ModeEntry> = serde_json::from_str(json)?;
        Self::new(modes)
    }

    /// Returns the modes in declaration order.
    #[inline]
    #[must_use]
    pub fn modes(&self) -> &[ModeEntry] {
        &self.modes
    }

    /// Returns the name of the current mode.
    #[must_use]
    pub fn current(&self) -> Option<&str> {
        let index = self.selection.lock().current?;
        Some(self.modes[index].name.as_str())
    }

    /// Returns `true` while a selection awaits the device's report.
    #[must_use]
    pub fn is_changing(&self) -> bool {
        self.selection.lock().changing
    }

    /// Applies one reported config element.
    ///
    /// Returns `true` if the element was a mode report.
    pub fn update(&self, element: &str) -> bool {
        if !self.modes.iter().all(|mode| element.contains(mode.command)) {
            return false;
        }
        let Some(index) = bracketed(element)
            .and_then(|command| self.modes.iter().position(|mode| mode.command == command))
        else {
            return false;
        };

        trace!(mode = %self.modes[index].name, "Mode reported");
        let mut selection = self.selection.lock();
        selection.current = Some(index);
        selection.confirmed = Some(index);
        selection.changing = false;
        true
    }

    /// Drops a provisional selection in favor of the last reported mode.
    ///
    /// Returns `true` if a selection was reverted.
    pub fn revert(&self) -> bool {
        let mut selection = self.selection.lock();
        if !selection.changing {
            return false;
        }
        selection.current = selection.confirmed;
        selection.changing = false;
        debug!(
            mode = selection.current.map(|index| self.modes[index].name.as_str()),
            "Mode selection reverted"
        );
        true
    }

    /// Sends the command that selects `name`.
    ///
    /// The mode is provisional until the device reports it back.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `name` is not a configured mode
    /// - any error of [`Connection::write`], after which the selection is
    ///   reverted
    pub async fn select(&self, connection: &Connection, name: &str) -> Result<()> {
        let index = self
            .modes
            .iter()
            .position(|mode| mode.name == name)
            .ok_or_else(|| Error::config(format!("unknown mode '{name}'")))?;
        let command = self.modes[index].command.to_string();

        {
            let mut selection = self.selection.lock();
            selection.current = Some(index);
            selection.changing = true;
        }
        debug!(mode = name, %command, "Selecting mode");

        let written = connection.write(&command).await;
        if written.is_err() {
            self.revert();
        }
        written
    }

    /// Tracks mode reports and error messages received on `connection`.
    pub fn attach(self: &Arc<Self>, connection: &Connection) -> SubscriptionId {
        let readback = Arc::clone(self);
        connection.subscribe(move |event| match event {
            Event::ConfigElement(element) => {
                readback.update(element);
            }
            Event::Error(_) => {
                readback.revert();
            }
            _ => {}
        })
    }
}

/// The character between `[` and `]`.
fn bracketed(element: &str) -> Option<char> {
    let (_, rest) = element.split_once('[')?;
    let mut chars = rest.chars();
    let command = chars.next()?;
    (chars.next() == Some(']')).then_some(command)
}

// ============================================================================
// Tests
// ============================================================================

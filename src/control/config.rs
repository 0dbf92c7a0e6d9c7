//! Device configuration values.
//!
//! The device reports its settings as config elements of the form
//! `<prefix><value>` (e.g. `d500` for a delay of 500) and accepts the same
//! form as a command to change one.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::SubscriptionId;
use crate::protocol::{Event, HELP};
use crate::transport::Connection;

// ============================================================================
// ConfigEntry
// ============================================================================

/// One named setting and the prefix that carries it on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfigEntry {
    /// Display name.
    pub name: String,
    /// Command prefix, e.g. `d`.
    pub prefix: String,
}

impl ConfigEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
        }
    }
}

// ============================================================================
// ConfigReadback
// ============================================================================

/// Tracks the latest reported value of each configured setting.
#[derive(Debug)]
pub struct ConfigReadback {
    entries: Vec<ConfigEntry>,
    values: Mutex<FxHashMap<String, String>>,
}

impl ConfigReadback {
    /// Creates a readback with no values yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for empty or repeated names, or empty
    /// prefixes.
    pub fn new(entries: impl IntoIterator<Item = ConfigEntry>) -> Result<Self> {
        let entries: Vec<ConfigEntry> = entries.into_iter().collect();
        for (index, entry) in entries.iter().enumerate() {
            if entry.name.is_empty() || entry.prefix.is_empty() {
                return Err(Error::config(format!(
                    "config entry needs a name and a prefix: {entry:?}"
                )));
            }
            if entries[..index].iter().any(|other| other.name == entry.name) {
                return Err(Error::config(format!(
                    "config '{}' declared twice",
                    entry.name
                )));
            }
        }

        Ok(Self {
            entries,
            values: Mutex::new(FxHashMap::default()),
        })
    }

    /// Loads entries from a JSON array of `{"name": ..., "prefix": ...}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input, or any error of
    /// [`new`](Self::new).
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<ConfigEntry> = serde_json::from_str(json)?;
        Self::new(entries)
    }

    /// Returns the configured entries.
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[ConfigEntry] {
        &self.entries
    }

    /// Applies one reported config element.
    ///
    /// Every entry whose prefix starts the element takes the rest as its
    /// value. Returns `true` if any entry was updated.
    pub fn update(&self, element: &str) -> bool {
        let mut values = self.values.lock();
        let mut updated = false;
        for entry in &self.entries {
            if let Some(value) = element.strip_prefix(entry.prefix.as_str()) {
                trace!(name = %entry.name, value, "Config value reported");
                values.insert(entry.name.clone(), value.to_string());
                updated = true;
            }
        }
        updated
    }

    /// Returns the latest reported value of `name`.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<String> {
        self.values.lock().get(name).cloned()
    }

    /// Builds the command that sets `name` to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `name` is not configured.
    pub fn set_command(&self, name: &str, value: &str) -> Result<String> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| Error::config(format!("unknown config '{name}'")))?;
        Ok(format!("{}{}", entry.prefix, value.trim()))
    }

    /// Sends the command that sets `name` to `value`.
    ///
    /// The stored value changes only once the device reports it back.
    ///
    /// # Errors
    ///
    /// Any error of [`set_command`](Self::set_command) or
    /// [`Connection::write`].
    pub async fn apply(&self, connection: &Connection, name: &str, value: &str) -> Result<()> {
        let command = self.set_command(name, value)?;
        debug!(name, %command, "Applying config");
        connection.write(&command).await
    }

    /// Asks the device to report all of its settings.
    ///
    /// # Errors
    ///
    /// Any error of [`Connection::write`].
    pub async fn refresh(&self, connection: &Connection) -> Result<()> {
        connection.write(HELP).await
    }

    /// Tracks every config element received on `connection`.
    pub fn attach(self: &Arc<Self>, connection: &Connection) -> SubscriptionId {
        let readback = Arc::clone(self);
        connection.subscribe(move |event| {
            if let Event::ConfigElement(element) = event {
                readback.update(element);
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    use crate::protocol::ConnectionState;
    use crate::transport::ConnectionOptions;

    fn readback() -> ConfigReadback {
        ConfigReadback::new([
            ConfigEntry::new("delay", "d"),
            ConfigEntry::new("window", "w"),
        ])
        .expect("valid entries")
    }

    #[test]
    fn test_update_and_value() {
        let readback = readback();
        assert!(readback.value("delay").is_none());

        assert!(readback.update("d500"));
        assert!(!readback.update("x1"));
        assert_eq!(readback.value("delay").as_deref(), Some("500"));
        assert!(readback.value("window").is_none());
    }

    #[test]
    fn test_set_command() {
        let readback = readback();
        assert_eq!(readback.set_command("window", " 1200 ").expect("known"), "w1200");
        assert!(readback.set_command("speed", "1").is_err());
    }

    #[test]
    fn test_new_rejects_duplicates_and_empty() {
        assert!(
            ConfigReadback::new([ConfigEntry::new("a", "x"), ConfigEntry::new("a", "y")]).is_err()
        );
        assert!(ConfigReadback::new([ConfigEntry::new("a", "")]).is_err());
    }

    #[test]
    fn test_from_json() {
        let readback =
            ConfigReadback::from_json(r#"[{"name": "delay", "prefix": "d"}]"#).expect("valid");
        assert_eq!(readback.entries(), &[ConfigEntry::new("delay", "d")]);
    }

    #[tokio::test]
    async fn test_attach_and_apply() {
        let (client, device) = duplex(1024);
        let connection = Connection::connect(
            client,
            ConnectionOptions::new().with_read_timeout(Duration::from_millis(50)),
        )
        .expect("valid options");
        let readback = Arc::new(readback());
        readback.attach(&connection);

        let mut device = BufReader::new(device);
        readback.refresh(&connection).await.expect("written");
        readback.apply(&connection, "delay", "750").await.expect("written");

        let mut line = String::new();
        device.read_line(&mut line).await.expect("readable");
        assert_eq!(line, "?\n");
        line.clear();
        device.read_line(&mut line).await.expect("readable");
        assert_eq!(line, "d750\n");

        device
            .get_mut()
            .write_all(b"@d750;w1200\n")
            .await
            .expect("writable");
        drop(device);

        let mut state = connection.watch_state();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .expect("state observable");

        assert_eq!(readback.value("delay").as_deref(), Some("750"));
        assert_eq!(readback.value("window").as_deref(), Some("1200"));
    }
}

//! Running tallies of result statuses.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::identifiers::SubscriptionId;
use crate::protocol::{ParseEvent, ResultNames, ResultParser, ResultRecord};
use crate::transport::Connection;

// ============================================================================
// StatsSnapshot
// ============================================================================

/// Point-in-time copy of the tallies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Count per counted status, in configuration order.
    pub counts: Vec<(String, u64)>,
    /// Statuses that were rewarded.
    pub rewarded: u64,
}

// ============================================================================
// ResultStats
// ============================================================================

/// Counts selected statuses as result messages arrive.
///
/// `counted` statuses each get their own tally; every `rewarded` status
/// also increments the combined reward tally.
#[derive(Debug)]
pub struct ResultStats {
    counted: Vec<String>,
    rewarded: Vec<String>,
    tallies: Mutex<Tallies>,
}

#[derive(Debug, Default)]
struct Tallies {
    counts: FxHashMap<String, u64>,
    rewarded: u64,
}

impl ResultStats {
    /// Creates zeroed tallies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a name is not a status name of `names`.
    pub fn new(
        names: &ResultNames,
        counted: impl IntoIterator<Item = impl Into<String>>,
        rewarded: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self> {
        let counted: Vec<String> = counted.into_iter().map(Into::into).collect();
        let rewarded: Vec<String> = rewarded.into_iter().map(Into::into).collect();

        for name in counted.iter().chain(&rewarded) {
            if !names.is_status(name) {
                return Err(Error::config(format!("'{name}' is not a status name")));
            }
        }

        Ok(Self {
            counted,
            rewarded,
            tallies: Mutex::new(Tallies::default()),
        })
    }

    /// Adds one record. Only status records are tallied.
    pub fn record(&self, record: &ResultRecord) {
        let ResultRecord::Status { name } = record else {
            return;
        };

        let mut tallies = self.tallies.lock();
        if self.counted.contains(name) {
            *tallies.counts.entry(name.clone()).or_default() += 1;
        }
        if self.rewarded.contains(name) {
            tallies.rewarded += 1;
        }
    }

    /// Returns the tally of a counted status.
    #[must_use]
    pub fn count(&self, status: &str) -> u64 {
        self.tallies.lock().counts.get(status).copied().unwrap_or(0)
    }

    /// Returns the reward tally.
    #[must_use]
    pub fn rewarded(&self) -> u64 {
        self.tallies.lock().rewarded
    }

    /// Returns all tallies.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let tallies = self.tallies.lock();
        StatsSnapshot {
            counts: self
                .counted
                .iter()
                .map(|name| (name.clone(), tallies.counts.get(name).copied().unwrap_or(0)))
                .collect(),
            rewarded: tallies.rewarded,
        }
    }

    /// Resets every tally to zero.
    pub fn clear(&self) {
        let mut tallies = self.tallies.lock();
        tallies.counts.clear();
        tallies.rewarded = 0;
    }

    /// Tallies every result message `parser` reads on `connection`.
    pub fn attach(
        self: &Arc<Self>,
        parser: &Arc<ResultParser>,
        connection: &Connection,
    ) -> SubscriptionId {
        let stats = Arc::clone(self);
        parser.attach(connection, move |event| {
            if let ParseEvent::Record(record) = event {
                stats.record(record);
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

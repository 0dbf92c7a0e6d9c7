//! Host-side control built on a [`Connection`](crate::Connection).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `repeat` | [`LoopScheduler`]: bounded repeats of one command |
//! | `criteria` | [`Criteria`]: whether a response counts |
//! | `stats` | [`ResultStats`]: status tallies |
//! | `config` | [`ConfigReadback`]: device settings |
//! | `mode` | [`ModeReadback`]: task mode selection |

// ============================================================================
// Submodules
// ============================================================================

/// Device configuration values.
pub mod config;

/// Evaluation predicates for loop iterations.
pub mod criteria;

/// Task mode selection.
pub mod mode;

/// Bounded repeats of one command.
pub mod repeat;

/// Running tallies of result statuses.
pub mod stats;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigEntry, ConfigReadback};
pub use criteria::Criteria;
pub use mode::{ModeEntry, ModeReadback};
pub use repeat::{LoopEvent, LoopHandler, LoopScheduler, LoopState, RepeatOptions, RunSummary};
pub use stats::{ResultStats, StatsSnapshot};

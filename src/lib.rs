//! ublock - host-side protocol engine for microcontroller task devices.
//!
//! This library talks to a behavioral-task device (an Arduino-class board)
//! over a serial or TCP link using a line-oriented ASCII protocol.
//!
//! # Architecture
//!
//! The engine follows an event-driven model:
//!
//! - **Device**: emits one sigil-prefixed line per message
//! - **Host (Rust)**: classifies lines into events, writes commands, and
//!   drives repeats of a command
//!
//! Key design principles:
//!
//! - Each [`Connection`] owns: link + event loop task + request tracker
//! - Dispatch of an inbound line and writes never interleave
//! - Subscribers observe [`Event`]s in line-arrival order
//! - Result bodies are parsed by a first-match, prefix-based [`ResultParser`]
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ublock::{
//!     Connection, ConnectionOptions, LoopScheduler, RepeatOptions, Result, ResultNames,
//!     ResultParser,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let connection = Connection::open("/dev/ttyACM0", ConnectionOptions::new()).await?;
//!
//!     // Parse every result message
//!     let names = ResultNames::new()
//!         .with_status(["hit", "miss"])
//!         .with_values(["wait"])
//!         .with_arrays(["lick"]);
//!     let parser = Arc::new(ResultParser::new(names)?);
//!     parser.attach(&connection, |event| println!("{event:?}"));
//!
//!     // Run ten trials
//!     let scheduler = LoopScheduler::new(connection.clone(), RepeatOptions::new("X", 10))?;
//!     scheduler.start()?;
//!     if let Some(summary) = scheduler.wait().await {
//!         println!("Done: {} of {}", summary.actual, summary.planned);
//!     }
//!
//!     connection.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`control`] | Loop scheduler, evaluation criteria, stats, config and mode readback |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Line classification, events, result parser |
//! | [`transport`] | Links, connection event loop, request tracking |

// ============================================================================
// Modules
// ============================================================================

/// Host-side control: repeats, criteria, statistics, configuration, modes.
pub mod control;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Line protocol: sigils, classification, events, result tokens.
pub mod protocol;

/// Device transport layer.
///
/// Link opening, the connection event loop, and request tracking.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Control types
pub use control::{
    ConfigEntry, ConfigReadback, Criteria, LoopEvent, LoopScheduler, LoopState, ModeEntry,
    ModeReadback, RepeatOptions, ResultStats, RunSummary, StatsSnapshot,
};

// Error types
pub use error::{Error, Result, TokenError};

// Identifier types
pub use identifiers::{RunId, SubscriptionId};

// Protocol types
pub use protocol::{
    ConnectionState, Event, Message, MessageKind, ParseEvent, ResultNames, ResultParser,
    ResultRecord, ReturnKind,
};

// Transport types
pub use transport::{Address, Connection, ConnectionOptions, ReadyPolicy, RequestTracker};

//! Device transport layer.
//!
//! This module owns the link to the task device: opening it, reading and
//! dispatching inbound lines, writing commands, and tracking the one
//! outstanding repeatable-action request.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                          ┌──────────────────┐
//! │  Host (Rust)     │     serial / TCP link    │  Task device     │
//! │                  │◄────────────────────────►│                  │
//! │  Connection      │   one ASCII line each    │  firmware        │
//! │  → event loop    │                          │                  │
//! └──────────────────┘                          └──────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `Address::parse` - Resolve a serial path or `tcp://` URL
//! 2. `Connection::open` - Acquire the link, spawn the event loop
//! 3. `Connection::subscribe` - Observe classified events
//! 4. `Connection::write` / `begin_request` - Send commands
//! 5. `Connection::close` - Abandon any pending request, release the link
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `address` | Link addresses and link opening |
//! | `connection` | Connection and event loop |
//! | `options` | Connection configuration |
//! | `tracker` | Pending-request tracking |

// ============================================================================
// Submodules
// ============================================================================

/// Link addresses.
pub mod address;

/// Device connection and event loop.
pub mod connection;

/// Connection configuration.
pub mod options;

/// Pending-request tracking.
pub mod tracker;

// ============================================================================
// Re-exports
// ============================================================================

pub use address::{Address, Link, LinkStream};
pub use connection::{Connection, EventHandler};
pub use options::{
    ConnectionOptions, DEFAULT_BAUD_RATE, DEFAULT_MAX_LINE_LENGTH, DEFAULT_READ_TIMEOUT,
    ReadyPolicy,
};
pub use tracker::RequestTracker;

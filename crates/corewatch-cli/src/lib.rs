//! corewatch CLI - client library for the corewatch daemon
//!
//! Everything the `corewatch` binary needs to talk to `corewatchd`:
//!
//! 1. **[`client::DaemonClient`]**: one connection, one request at a time
//! 2. **[`client::EventFollower`]**: a subscribed connection that survives
//!    daemon restarts, reconnecting with exponential backoff
//! 3. **[`daemon`]**: pid-file checks and auto-start of the daemon
//! 4. **[`format`]**: human-readable rendering of replies and events

pub mod client;
pub mod daemon;
pub mod error;
pub mod format;

pub use client::{ClientConfig, DaemonClient, EventFollower};
pub use error::{CliError, Result};

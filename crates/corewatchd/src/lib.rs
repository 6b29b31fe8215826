//! corewatch daemon - proxy core supervisor and live connection-log monitor
//!
//! This crate provides the daemon's infrastructure:
//! - `supervisor` - Spawns, stops and restarts the proxy core process
//! - `register` - Global state register with listener notifications
//! - `monitor` - Connection-log monitor actor over the core's diagnostic API
//! - `server` - Unix socket server for client connections
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      corewatchd daemon                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  DaemonServer   │────▶│  CoreSupervisor             │   │
//! │  │ (Unix Socket)   │     │  (child process owner)      │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │ state updates     │
//! │           │                             ▼                   │
//! │           │              ┌─────────────────────────────┐   │
//! │           │              │  StateRegister              │   │
//! │           │              │  (listeners, persistence)   │   │
//! │           │              └──────┬───────────────┬──────┘   │
//! │           │                     │               │           │
//! │           │                     ▼               ▼           │
//! │           │              ┌─────────────┐ ┌─────────────┐   │
//! │           │─────────────▶│MonitorActor │ │Presentation │   │
//! │           │              │ (log stream)│ │Bridge       │   │
//! │           │              └──────┬──────┘ └──────┬──────┘   │
//! │           │   events            ▼               ▼           │
//! │           ◀──────────────────── EventBus ◀──────┘           │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The supervisor and the monitor never call each other; lifecycle flows
//! through the register's notifications.
//!
//! # Panic-Free Guarantees
//!
//! Production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod events;
pub mod extract;
pub mod monitor;
pub mod proxy;
pub mod register;
pub mod server;
pub mod services;
pub mod store;
pub mod supervisor;

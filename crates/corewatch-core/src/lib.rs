//! corewatch Core - Shared types for proxy core supervision
//!
//! This crate provides the domain types shared between the daemon
//! (corewatchd), the wire protocol and the CLI client.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod connection;
pub mod decode;
pub mod error;
pub mod mapping;
pub mod runtime;
pub mod state;

// Re-exports for convenience
pub use connection::{
    ConnectionGroup, ConnectionGroups, ConnectionLogEntry, ConnectionSnapshot, Direction,
    GroupDimension, GroupMap, GroupsSnapshot, LogHistory, MonitorPhase, MonitoringState,
    DEFAULT_PRESERVE_SECS, GROUP_CAPACITY, HISTORY_CAPACITY, RECENT_LOGS_CAPACITY, UNKNOWN,
};
pub use decode::decode_entry;
pub use error::{DomainError, DomainResult};
pub use mapping::{apply_settings, default_mappings, FieldMapping, RuntimeField, SettingTransform};
pub use runtime::{
    CoreFamily, CoreStatus, ExitReport, ProxyRuntimeConfig, DEFAULT_PROXY_HOST, DEFAULT_PROXY_PORT,
};
pub use state::{
    ConnectionMonitorState, GlobalState, GlobalStatePatch, PersistedState, StateEventKind,
    StateField, StateNotification, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS,
};

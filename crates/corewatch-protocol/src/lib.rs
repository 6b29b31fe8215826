//! corewatch Protocol - Wire types for daemon communication
//!
//! Two wire surfaces live here: the newline-delimited JSON exchanged
//! between the daemon and its clients over the Unix socket, and the raw
//! records streamed by the core's diagnostic log endpoint.

pub mod event;
pub mod message;
pub mod record;
pub mod version;

pub use event::{OutputStream, PresentationEvent};
pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use record::RawLogRecord;
pub use version::{ProtocolVersion, VersionError};

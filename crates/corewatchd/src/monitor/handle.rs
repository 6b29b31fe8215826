//! Client interface for the monitor actor.

use corewatch_core::ConnectionSnapshot;
use tokio::sync::{mpsc, oneshot};

use super::commands::{MonitorCommand, MonitorError, MonitorStatus};

/// Cheap-to-clone handle to the monitor actor.
///
/// Events produced by the monitor are published on the daemon's
/// [`EventBus`](crate::events::EventBus), not through this handle.
#[derive(Clone)]
pub struct MonitorHandle {
    sender: mpsc::Sender<MonitorCommand>,
}

impl MonitorHandle {
    pub fn new(sender: mpsc::Sender<MonitorCommand>) -> Self {
        Self { sender }
    }

    /// Starts monitoring, or resumes it inside the preserve window.
    ///
    /// # Errors
    ///
    /// - `MonitorError::CoreNotRunning` if no core is running
    /// - `MonitorError::ChannelClosed` if the actor has shut down
    pub async fn start(&self) -> Result<MonitorStatus, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::Start { respond_to: tx })
            .await
            .map_err(|_| MonitorError::ChannelClosed)?;
        rx.await.map_err(|_| MonitorError::ChannelClosed)?
    }

    /// Stops monitoring. Stopping twice is not an error.
    pub async fn stop(&self) -> Result<MonitorStatus, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::Stop { respond_to: tx })
            .await
            .map_err(|_| MonitorError::ChannelClosed)?;
        rx.await.map_err(|_| MonitorError::ChannelClosed)
    }

    /// Drops history and groups; clients receive `connection-log-reset`.
    pub async fn clear_history(&self) -> Result<(), MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::ClearHistory { respond_to: tx })
            .await
            .map_err(|_| MonitorError::ChannelClosed)?;
        rx.await.map_err(|_| MonitorError::ChannelClosed)
    }

    pub async fn snapshot(&self) -> Result<ConnectionSnapshot, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::Snapshot { respond_to: tx })
            .await
            .map_err(|_| MonitorError::ChannelClosed)?;
        rx.await.map_err(|_| MonitorError::ChannelClosed)
    }
}

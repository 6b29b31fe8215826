//! Observer interface for state register notifications.

use std::sync::Arc;

use corewatch_core::StateNotification;
use thiserror::Error;

/// A listener failed to handle a notification. Logged, never propagated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Listener failed: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Receives every notification the register emits, in registration order.
///
/// Called synchronously on the mutating thread, so implementations should
/// hand work off (channel send) rather than block.
pub trait StateListener: Send + Sync {
    fn on_state_change(&self, notification: &StateNotification) -> Result<(), ListenerError>;
}

impl<F> StateListener for F
where
    F: Fn(&StateNotification) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_state_change(&self, notification: &StateNotification) -> Result<(), ListenerError> {
        self(notification)
    }
}

/// Shared listener handle, as stored by the register.
pub type SharedListener = Arc<dyn StateListener>;

/// Identity of a listener, independent of its vtable.
pub(crate) fn listener_id(listener: &SharedListener) -> *const () {
    Arc::as_ptr(listener) as *const ()
}

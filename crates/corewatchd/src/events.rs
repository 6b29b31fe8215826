//! Presentation event fan-out.
//!
//! Everything a client can observe flows through one broadcast channel.
//! Supervisor lifecycle events reach it via [`PresentationBridge`], a state
//! register listener; the monitor and the core output readers publish
//! directly.

use std::sync::Arc;

use corewatch_core::{StateEventKind, StateField, StateNotification};
use corewatch_protocol::PresentationEvent;
use tokio::sync::broadcast;
use tracing::trace;

use crate::register::{ListenerError, SharedListener, StateListener};

/// Default event buffer size
pub const EVENT_BUFFER: usize = 256;

/// Cheap-to-clone publisher/subscriber handle.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PresentationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: PresentationEvent) {
        trace!(event = event.name(), "Publishing presentation event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresentationEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}

/// Translates register notifications into presentation events.
pub struct PresentationBridge {
    bus: EventBus,
}

impl PresentationBridge {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    pub fn shared(bus: EventBus) -> SharedListener {
        Arc::new(Self::new(bus))
    }

    fn translate(notification: &StateNotification) -> Vec<PresentationEvent> {
        let mut events = Vec::new();

        match notification.kind {
            StateEventKind::CoreStarted => events.push(PresentationEvent::CoreStarted {
                config_path: notification.new_state.config_path.clone(),
                start_time: notification.new_state.start_time,
            }),
            StateEventKind::CoreStopping => events.push(PresentationEvent::CoreStopping),
            StateEventKind::CoreStopped => events.push(PresentationEvent::CoreStopped),
            _ => {}
        }

        if notification.changed(StateField::IsRunning) {
            events.push(PresentationEvent::StatusChanged {
                is_running: notification.new_state.is_running,
            });
        }

        events
    }
}

impl StateListener for PresentationBridge {
    fn on_state_change(&self, notification: &StateNotification) -> Result<(), ListenerError> {
        for event in Self::translate(notification) {
            self.bus.publish(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use corewatch_core::{GlobalState, GlobalStatePatch};

    fn notification(kind: StateEventKind, patch: GlobalStatePatch) -> StateNotification {
        let old_state = GlobalState::default();
        let mut new_state = old_state.clone();
        let changes = patch.apply(&mut new_state);
        StateNotification {
            kind,
            old_state,
            new_state,
            changes,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_core_started_emits_status_change() {
        let events = PresentationBridge::translate(&notification(
            StateEventKind::CoreStarted,
            GlobalStatePatch::none().running(true),
        ));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "core-started");
        assert_eq!(events[1], PresentationEvent::StatusChanged { is_running: true });
    }

    #[test]
    fn test_monitor_updates_are_not_presented() {
        let events = PresentationBridge::translate(&notification(
            StateEventKind::ConnectionRetry,
            GlobalStatePatch::none(),
        ));
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let bridge = PresentationBridge::new(bus.clone());

        bridge
            .on_state_change(&notification(StateEventKind::CoreStopping, GlobalStatePatch::none()))
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), PresentationEvent::CoreStopping);
        assert_eq!(bus.subscriber_count(), 1);
    }
}

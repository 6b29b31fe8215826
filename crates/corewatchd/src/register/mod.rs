//! Global state register.
//!
//! Holds the cross-cutting [`GlobalState`] and a listener registry. The
//! supervisor and the monitor never talk to each other directly: both
//! mutate state here and react to the notifications it emits.
//!
//! # Delivery
//!
//! Every mutation merges under the state lock, then releases it and
//! delivers one [`StateNotification`] to a snapshot of the listeners taken
//! at that moment, in registration order. A listener that errors or panics
//! is logged and skipped; the remaining listeners still run. Adding or
//! removing a listener while a notification is in flight affects only
//! later notifications.
//!
//! # Panic-Free Guarantees
//!
//! Poisoned locks are recovered with `into_inner()`. Listener panics are
//! caught with `catch_unwind`.

mod listener;

pub use listener::{ListenerError, SharedListener, StateListener};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use corewatch_core::{
    ConnectionMonitorState, GlobalState, GlobalStatePatch, PersistedState, StateEventKind,
    StateField, StateNotification,
};

use crate::store::StateStore;
use listener::listener_id;

/// Store key for the persisted snapshot.
pub const PERSISTED_STATE_KEY: &str = "core.lastState";

/// Result of [`StateRegister::record_connection_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Retry counted; more attempts are allowed.
    Recorded { retry_count: u32 },
    /// This retry reached the ceiling. Monitoring is now disabled.
    CeilingReached { retry_count: u32 },
    /// The ceiling had already been reached; nothing changed.
    Exhausted,
}

impl RetryOutcome {
    pub fn allows_retry(&self) -> bool {
        matches!(self, Self::Recorded { .. })
    }
}

/// Process-wide state hub. Share it as `Arc<StateRegister>`.
pub struct StateRegister {
    state: Mutex<GlobalState>,
    listeners: Mutex<Vec<SharedListener>>,
    store: Arc<dyn StateStore>,
    development: bool,
}

impl StateRegister {
    pub fn new(store: Arc<dyn StateStore>, development: bool) -> Self {
        Self {
            state: Mutex::new(GlobalState::default()),
            listeners: Mutex::new(Vec::new()),
            store,
            development,
        }
    }

    /// Sets the connection monitor's retry ceiling and base delay.
    pub fn with_retry_policy(self, max_retries: u32, retry_delay_ms: u64) -> Self {
        {
            let mut state = self.lock_state();
            state.connection_monitor.max_retries = max_retries;
            state.connection_monitor.retry_delay = retry_delay_ms;
        }
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, GlobalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<SharedListener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_development(&self) -> bool {
        self.development
    }

    /// Current state.
    pub fn snapshot(&self) -> GlobalState {
        self.lock_state().clone()
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Registers a listener. Returns false if it was already registered.
    pub fn add_listener(&self, listener: SharedListener) -> bool {
        let mut listeners = self.lock_listeners();
        let id = listener_id(&listener);
        if listeners.iter().any(|l| listener_id(l) == id) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, listener: &SharedListener) -> bool {
        let mut listeners = self.lock_listeners();
        let id = listener_id(listener);
        let before = listeners.len();
        listeners.retain(|l| listener_id(l) != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Merges `patch` and notifies listeners with a plain update.
    pub fn update(&self, patch: GlobalStatePatch) -> Vec<StateField> {
        self.update_with(StateEventKind::StateUpdate, patch)
    }

    /// Merges `patch` and notifies listeners with the given kind.
    ///
    /// Listeners are notified even when nothing changed, so lifecycle kinds
    /// can be emitted with an empty patch.
    pub fn update_with(&self, kind: StateEventKind, patch: GlobalStatePatch) -> Vec<StateField> {
        self.commit(kind, |_| patch)
    }

    /// Builds a patch from the current state and merges it under one lock.
    fn commit<F>(&self, kind: StateEventKind, build: F) -> Vec<StateField>
    where
        F: FnOnce(&GlobalState) -> GlobalStatePatch,
    {
        let (old_state, new_state, changes) = {
            let mut state = self.lock_state();
            let old_state = state.clone();
            let changes = build(&state).apply(&mut state);
            (old_state, state.clone(), changes)
        };

        let notification = StateNotification {
            kind,
            old_state,
            new_state,
            changes: changes.clone(),
            timestamp: Utc::now(),
        };
        self.deliver(&notification);
        changes
    }

    /// Emits a notification without changing state.
    pub fn notify(&self, kind: StateEventKind) {
        self.update_with(kind, GlobalStatePatch::none());
    }

    fn deliver(&self, notification: &StateNotification) {
        let listeners: Vec<SharedListener> = self.lock_listeners().clone();

        debug!(
            kind = %notification.kind,
            changes = ?notification.changes,
            listeners = listeners.len(),
            "State notification"
        );

        for (index, listener) in listeners.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_state_change(notification)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = index, kind = %notification.kind, error = %e, "State listener failed");
                }
                Err(_) => {
                    error!(listener = index, kind = %notification.kind, "State listener panicked");
                }
            }
        }
    }

    fn update_monitor<F>(&self, kind: StateEventKind, mutate: F)
    where
        F: FnOnce(&mut ConnectionMonitorState),
    {
        self.commit(kind, |state| {
            let mut monitor = state.connection_monitor.clone();
            mutate(&mut monitor);
            GlobalStatePatch::none().connection_monitor(monitor)
        });
    }

    /// Marks the register as initialized after startup restore.
    pub fn mark_initialized(&self) {
        self.update(GlobalStatePatch::none().initialized(true));
    }

    // ========================================================================
    // Connection monitor
    // ========================================================================

    /// Explicit enable. Clears any previous retry history.
    pub fn enable_connection_monitor(&self) {
        self.update_monitor(StateEventKind::ConnectionMonitorEnabled, |m| {
            m.enabled = true;
            m.retry_count = 0;
            m.last_retry_time = None;
        });
    }

    pub fn disable_connection_monitor(&self) {
        self.update_monitor(StateEventKind::ConnectionMonitorDisabled, |m| {
            m.enabled = false;
        });
    }

    /// Resets the retry counters without touching `enabled`.
    pub fn reset_connection_monitor(&self) {
        self.update_monitor(StateEventKind::ConnectionMonitorReset, |m| {
            m.retry_count = 0;
            m.last_retry_time = None;
        });
    }

    /// Counts one failed connection attempt.
    ///
    /// The check and increment happen under one lock, so concurrent callers
    /// cannot both reach the ceiling. Reaching it disables monitoring and
    /// emits exactly one [`StateEventKind::MaxRetries`] notification; calls
    /// beyond the ceiling change nothing.
    pub fn record_connection_retry(&self) -> RetryOutcome {
        let (old_state, new_state, changes, retry_count, reached) = {
            let mut state = self.lock_state();
            if state.connection_monitor.is_exhausted() {
                return RetryOutcome::Exhausted;
            }
            let old_state = state.clone();
            let mut monitor = state.connection_monitor.clone();
            monitor.retry_count = monitor.retry_count.saturating_add(1);
            monitor.last_retry_time = Some(Utc::now());
            let retry_count = monitor.retry_count;
            let reached = monitor.is_exhausted();
            let changes = GlobalStatePatch::none()
                .connection_monitor(monitor)
                .apply(&mut state);
            (old_state, state.clone(), changes, retry_count, reached)
        };

        self.deliver(&StateNotification {
            kind: StateEventKind::ConnectionRetry,
            old_state,
            new_state,
            changes,
            timestamp: Utc::now(),
        });

        if !reached {
            return RetryOutcome::Recorded { retry_count };
        }

        error!(retry_count, "Connection monitor retry ceiling reached");
        self.disable_connection_monitor();
        self.notify(StateEventKind::MaxRetries);
        RetryOutcome::CeilingReached { retry_count }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Persists the current state.
    pub fn save_state(&self) -> bool {
        self.save_state_with(self.snapshot())
    }

    /// Persists the given state instead of the current one.
    pub fn save_state_with(&self, state: GlobalState) -> bool {
        let persisted = PersistedState {
            state,
            development: self.development,
            saved_at: Utc::now(),
        };
        let value = match serde_json::to_value(&persisted) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to encode state");
                return false;
            }
        };
        self.store.set(PERSISTED_STATE_KEY, value)
    }

    /// Loads the persisted snapshot.
    ///
    /// A snapshot captured in development is ignored by a production run.
    pub fn load_state(&self) -> Option<PersistedState> {
        let value = self.store.get(PERSISTED_STATE_KEY)?;
        let persisted: PersistedState = match serde_json::from_value(value) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable persisted state");
                return None;
            }
        };

        if !persisted.is_loadable_in(self.development) {
            info!("Ignoring state captured in a development run");
            return None;
        }
        Some(persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn register() -> StateRegister {
        StateRegister::new(Arc::new(MemoryStore::new()), false)
    }

    fn recorder() -> (SharedListener, Arc<Mutex<Vec<StateEventKind>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: SharedListener = Arc::new(move |n: &StateNotification| -> Result<(), ListenerError> {
            sink.lock().unwrap().push(n.kind);
            Ok(())
        });
        (listener, seen)
    }

    #[test]
    fn test_update_reports_changes_to_listeners() {
        let register = register();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        register.add_listener(Arc::new(move |n: &StateNotification| -> Result<(), ListenerError> {
            assert!(n.new_state.is_running);
            assert!(!n.old_state.is_running);
            sink.lock().unwrap().extend(n.changes.clone());
            Ok(())
        }));

        register.update(GlobalStatePatch::none().running(true));
        assert_eq!(*changes.lock().unwrap(), vec![StateField::IsRunning]);
        assert!(register.snapshot().is_running);
    }

    #[test]
    fn test_listener_registration_is_idempotent() {
        let register = register();
        let (listener, seen) = recorder();

        assert!(register.add_listener(Arc::clone(&listener)));
        assert!(!register.add_listener(Arc::clone(&listener)));
        assert_eq!(register.listener_count(), 1);

        register.notify(StateEventKind::CoreStarted);
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(register.remove_listener(&listener));
        assert!(!register.remove_listener(&listener));
        register.notify(StateEventKind::CoreStopped);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let register = register();
        register.add_listener(Arc::new(|_: &StateNotification| -> Result<(), ListenerError> {
            Err(ListenerError::new("boom"))
        }));
        register.add_listener(Arc::new(|_: &StateNotification| -> Result<(), ListenerError> {
            panic!("listener panic")
        }));
        let (listener, seen) = recorder();
        register.add_listener(listener);

        register.notify(StateEventKind::CoreStopping);
        assert_eq!(*seen.lock().unwrap(), vec![StateEventKind::CoreStopping]);
    }

    #[test]
    fn test_listeners_notified_in_registration_order() {
        let register = register();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let sink = Arc::clone(&order);
            register.add_listener(Arc::new(move |_: &StateNotification| -> Result<(), ListenerError> {
                sink.lock().unwrap().push(i);
                Ok(())
            }));
        }
        register.notify(StateEventKind::StateUpdate);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_record_retry_ceiling_emits_once() {
        let register = register().with_retry_policy(3, 100);
        register.enable_connection_monitor();

        let max_notifications = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&max_notifications);
        register.add_listener(Arc::new(move |n: &StateNotification| -> Result<(), ListenerError> {
            if n.kind == StateEventKind::MaxRetries {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }));

        assert_eq!(
            register.record_connection_retry(),
            RetryOutcome::Recorded { retry_count: 1 }
        );
        assert_eq!(
            register.record_connection_retry(),
            RetryOutcome::Recorded { retry_count: 2 }
        );
        assert_eq!(
            register.record_connection_retry(),
            RetryOutcome::CeilingReached { retry_count: 3 }
        );
        assert_eq!(register.record_connection_retry(), RetryOutcome::Exhausted);
        assert_eq!(register.record_connection_retry(), RetryOutcome::Exhausted);

        let monitor = register.snapshot().connection_monitor;
        assert_eq!(monitor.retry_count, 3);
        assert!(!monitor.enabled);
        assert_eq!(max_notifications.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enable_resets_retries() {
        let register = register().with_retry_policy(2, 100);
        register.record_connection_retry();
        register.record_connection_retry();
        assert!(!register.snapshot().connection_monitor.enabled);

        register.enable_connection_monitor();
        let monitor = register.snapshot().connection_monitor;
        assert!(monitor.enabled);
        assert_eq!(monitor.retry_count, 0);
        assert!(register.record_connection_retry().allows_retry());
    }

    #[test]
    fn test_save_and_load_state() {
        let register = register();
        register.update(GlobalStatePatch::none().running(true));
        assert!(register.save_state());

        let loaded = register.load_state().unwrap();
        assert!(loaded.state.is_running);
        assert!(!loaded.development);
    }

    #[test]
    fn test_development_state_not_loaded_in_production() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let dev = StateRegister::new(Arc::clone(&store), true);
        dev.update(GlobalStatePatch::none().running(true));
        assert!(dev.save_state());
        assert!(dev.load_state().is_some());

        let prod = StateRegister::new(store, false);
        assert!(prod.load_state().is_none());
    }
}

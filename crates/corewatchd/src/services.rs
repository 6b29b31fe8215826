//! Wiring of the daemon's long-lived services.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::events::{EventBus, PresentationBridge};
use crate::extract::{ConfigPortExtractor, CoreConfigExtractor};
use crate::monitor::{spawn_monitor, MonitorContext, MonitorHandle, MonitorSettings};
use crate::proxy::{NoopProxyToggle, ProxyToggle, SystemProxyToggle};
use crate::register::StateRegister;
use crate::server::DaemonContext;
use crate::store::StateStore;
use crate::supervisor::{CoreSupervisor, SupervisorSettings};

/// The register, supervisor and monitor, connected to one event bus.
pub struct DaemonServices {
    pub register: Arc<StateRegister>,
    pub events: EventBus,
    pub supervisor: CoreSupervisor,
    pub monitor: MonitorHandle,
}

impl DaemonServices {
    /// Builds every service and spawns the monitor actor. Must be called
    /// inside a tokio runtime.
    pub fn start(
        config: &DaemonConfig,
        store: Arc<dyn StateStore>,
        proxy: Arc<dyn ProxyToggle>,
        shutdown: CancellationToken,
    ) -> Self {
        let register = Arc::new(
            StateRegister::new(store, config.is_development())
                .with_retry_policy(config.monitor.max_retries, config.monitor.base_delay_ms),
        );
        let events = EventBus::default();
        register.add_listener(PresentationBridge::shared(events.clone()));

        let extractor: Arc<dyn ConfigPortExtractor> = Arc::new(CoreConfigExtractor);
        let supervisor = CoreSupervisor::new(
            SupervisorSettings::from_config(config),
            config.runtime(),
            register.clone(),
            proxy,
            extractor.clone(),
            events.clone(),
        );

        let settings = MonitorSettings::from_config(&config.monitor);
        let client = reqwest::Client::builder()
            .connect_timeout(settings.idle_timeout)
            .build()
            .unwrap_or_default();
        let monitor = spawn_monitor(
            settings,
            MonitorContext {
                register: register.clone(),
                extractor,
                events: events.clone(),
                client,
            },
            shutdown,
        );

        Self {
            register,
            events,
            supervisor,
            monitor,
        }
    }

    pub fn context(&self) -> DaemonContext {
        DaemonContext {
            supervisor: self.supervisor.clone(),
            monitor: self.monitor.clone(),
            register: self.register.clone(),
            events: self.events.clone(),
        }
    }
}

/// The proxy toggle for this host: the platform tool when one is
/// available, otherwise a no-op.
///
/// `proxy.enable_system_proxy` only sets the default for each start; a
/// `systemProxy` start override needs a working toggle even when it is off.
/// The toggle touches OS settings only on `enable`, and remembers that in
/// `store` so a later daemon can clear a proxy left behind by a crash.
pub fn platform_proxy_toggle(config: &DaemonConfig, store: Arc<dyn StateStore>) -> Arc<dyn ProxyToggle> {
    match SystemProxyToggle::detect() {
        Some(toggle) => {
            let toggle = toggle.with_store(store);
            info!(
                backend = ?toggle.backend(),
                default_on = config.proxy.enable_system_proxy,
                leftover = toggle.is_active(),
                "System proxy support available"
            );
            Arc::new(toggle)
        }
        None => {
            if config.proxy.enable_system_proxy {
                warn!("No system proxy tool found, system proxy disabled");
            }
            Arc::new(NoopProxyToggle)
        }
    }
}

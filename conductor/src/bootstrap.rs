use crate::config::ConductorConfig;
use crate::core::ConductorCore;
use crate::driver::{Driver, DriverRegistry};
use crate::notifications::NotificationSink;
use crate::store::Store;
use std::sync::Arc;

/// Dependency-injection root: wires a [`Store`] implementation, the set of
/// loaded drivers, and a [`NotificationSink`] into a running
/// [`ConductorCore`]. A real binary supplies a `sqlx`-backed `Store` and
/// concrete drivers; tests supply the in-memory fakes in
/// [`crate::store::memory`] and [`crate::notifications::CapturingNotificationSink`].
pub struct Services {
    pub core: Arc<ConductorCore>,
}

impl Services {
    pub async fn new(
        hostname: String,
        config: ConductorConfig,
        store: Arc<dyn Store>,
        drivers: Vec<Arc<Driver>>,
        notifications: Arc<dyn NotificationSink>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(DriverRegistry::new(drivers)?);
        let core = Arc::new(ConductorCore::new(
            hostname,
            config,
            store,
            registry,
            notifications,
        ));
        core.init_host().await?;

        Ok(Self { core })
    }
}

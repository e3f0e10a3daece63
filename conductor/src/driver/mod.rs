use crate::error::ConductorResult;
use crate::model::{JsonMap, PowerState};
use crate::task_manager::Task;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Outcome of an asynchronous deploy call: either the hardware finished
/// immediately (`Done`) or it requires an out-of-band callback before the
/// FSM can advance past `DEPLOYWAIT` (`Wait`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    Done,
    Wait,
}

#[async_trait]
pub trait PowerInterface: Send + Sync {
    async fn validate(&self, task: &Task) -> ConductorResult<()>;
    async fn get_power_state(&self, task: &Task) -> ConductorResult<PowerState>;
    async fn set_power_state(&self, task: &Task, state: PowerState) -> ConductorResult<()>;
    async fn reboot(&self, task: &Task) -> ConductorResult<()> {
        self.set_power_state(task, PowerState::Reboot).await
    }
}

#[async_trait]
pub trait DeployInterface: Send + Sync {
    async fn validate(&self, task: &Task) -> ConductorResult<()>;
    async fn prepare(&self, task: &Task) -> ConductorResult<()>;
    async fn deploy(&self, task: &Task) -> ConductorResult<DeployOutcome>;
    async fn clean_up(&self, task: &Task) -> ConductorResult<()>;
    async fn tear_down(&self, task: &Task) -> ConductorResult<()>;
    async fn take_over(&self, task: &Task) -> ConductorResult<()>;
}

#[async_trait]
pub trait ManagementInterface: Send + Sync {
    async fn validate(&self, task: &Task) -> ConductorResult<()>;
    async fn get_sensors_data(&self, task: &Task) -> ConductorResult<JsonMap>;
    async fn get_properties(&self) -> ConductorResult<BTreeMap<String, String>>;
    async fn get_supported_boot_devices(&self, task: &Task) -> ConductorResult<Vec<String>>;
    async fn get_boot_device(&self, task: &Task) -> ConductorResult<(String, bool)>;
    async fn set_boot_device(
        &self,
        task: &Task,
        device: &str,
        persistent: bool,
    ) -> ConductorResult<()>;
}

#[async_trait]
pub trait ConsoleInterface: Send + Sync {
    async fn validate(&self, task: &Task) -> ConductorResult<()>;
    async fn start_console(&self, task: &Task) -> ConductorResult<()>;
    async fn stop_console(&self, task: &Task) -> ConductorResult<()>;
    async fn get_console_information(&self, task: &Task) -> ConductorResult<JsonMap>;
}

/// Routing metadata for one vendor method, the current-generation mechanism
/// (§9 "Vendor routing"). `is_async` decides whether `vendor_passthru`
/// dispatches it through the worker pool or calls it inline.
#[derive(Debug, Clone)]
pub struct VendorRoute {
    pub allowed_http_methods: BTreeSet<String>,
    pub is_async: bool,
}

#[async_trait]
pub trait VendorInterface: Send + Sync {
    async fn validate(&self, task: &Task) -> ConductorResult<()>;

    /// Static routing table for `vendor_passthru` (per-node).
    fn vendor_routes(&self) -> BTreeMap<String, VendorRoute>;

    /// Static routing table for `driver_vendor_passthru` (driver-level).
    fn driver_routes(&self) -> BTreeMap<String, VendorRoute>;

    async fn call(
        &self,
        task: &Task,
        method: &str,
        info: &JsonMap,
    ) -> ConductorResult<serde_json::Value>;

    async fn call_driver(
        &self,
        method: &str,
        info: &JsonMap,
    ) -> ConductorResult<serde_json::Value>;

    /// Cheap synchronous capability probe (§9 "gate behind a capability
    /// probe"), so callers can decide whether to dispatch through the
    /// worker pool without invoking the legacy hook just to find out.
    fn has_legacy_vendor_passthru(&self) -> bool {
        false
    }

    /// Legacy, pre-routing-table entry point. Supported for one deprecation
    /// cycle per §9; always treated as asynchronous.
    async fn legacy_vendor_passthru(
        &self,
        _task: &Task,
        _method: &str,
        _info: &JsonMap,
    ) -> Option<ConductorResult<serde_json::Value>> {
        None
    }

    /// Legacy driver-level entry point. Always treated as synchronous.
    async fn legacy_driver_vendor_passthru(
        &self,
        _method: &str,
        _info: &JsonMap,
    ) -> Option<ConductorResult<serde_json::Value>> {
        None
    }
}

/// One hardware driver's capability surface. Every interface is optional;
/// a bare power-only driver is legal.
pub struct Driver {
    pub name: String,
    pub power: Option<Arc<dyn PowerInterface>>,
    pub deploy: Option<Arc<dyn DeployInterface>>,
    pub management: Option<Arc<dyn ManagementInterface>>,
    pub console: Option<Arc<dyn ConsoleInterface>>,
    pub vendor: Option<Arc<dyn VendorInterface>>,
}

impl Driver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            power: None,
            deploy: None,
            management: None,
            console: None,
            vendor: None,
        }
    }

    pub fn with_power(mut self, power: Arc<dyn PowerInterface>) -> Self {
        self.power = Some(power);
        self
    }

    pub fn with_deploy(mut self, deploy: Arc<dyn DeployInterface>) -> Self {
        self.deploy = Some(deploy);
        self
    }

    pub fn with_management(mut self, management: Arc<dyn ManagementInterface>) -> Self {
        self.management = Some(management);
        self
    }

    pub fn with_console(mut self, console: Arc<dyn ConsoleInterface>) -> Self {
        self.console = Some(console);
        self
    }

    pub fn with_vendor(mut self, vendor: Arc<dyn VendorInterface>) -> Self {
        self.vendor = Some(vendor);
        self
    }
}

/// Loads, names, and hands out driver instances (§4.A). Construction from
/// configuration lives outside the core; this registry just indexes the
/// already-instantiated set.
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<Driver>>,
}

impl DriverRegistry {
    pub fn new(drivers: Vec<Arc<Driver>>) -> crate::error::ConductorResult<Self> {
        if drivers.is_empty() {
            return Err(crate::error::ConductorError::NoDriversLoaded);
        }
        let drivers = drivers.into_iter().map(|d| (d.name.clone(), d)).collect();
        Ok(Self { drivers })
    }

    pub fn get(&self, name: &str) -> crate::error::ConductorResult<Arc<Driver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| crate::error::ConductorError::DriverNotFound(name.to_string()))
    }

    pub fn supported_driver_names(&self) -> BTreeSet<String> {
        self.drivers.keys().cloned().collect()
    }
}

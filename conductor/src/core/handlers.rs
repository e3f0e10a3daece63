use super::ConductorCore;
use crate::driver::DeployOutcome;
use crate::error::{ConductorError, ConductorResult};
use crate::model::{JsonMap, Node, Port, PowerState};
use crate::rpc::RequestContext;
use crate::state_machine::{Callback, ProvisionEvent};
use crate::task_manager::Task;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct InterfaceValidation {
    pub result: bool,
    pub reason: Option<String>,
}

impl ConductorCore {
    #[instrument(skip(self, _ctx, update))]
    pub async fn update_node(
        &self,
        _ctx: &RequestContext,
        node_id: i64,
        update: NodeUpdate,
    ) -> ConductorResult<Node> {
        info!(node_id, "update_node");
        if update.power_state.is_some() {
            return Err(ConductorError::InvalidParameterValue(
                "power_state may not be set directly via update_node".to_string(),
            ));
        }

        let mut task = self.tasks.acquire(node_id, false, update.driver.as_deref()).await?;
        let node = task.node_mut();

        if let Some(driver) = update.driver {
            node.driver = driver;
        }
        if let Some(maintenance) = update.maintenance {
            node.maintenance = maintenance;
            if !maintenance {
                node.maintenance_reason.clear();
            }
        }
        if let Some(reason) = update.maintenance_reason {
            node.maintenance_reason = reason;
        }
        if let Some(instance_info) = update.instance_info {
            node.instance_info = instance_info;
        }
        if let Some(driver_info) = update.driver_info {
            node.driver_info = driver_info;
        }
        if let Some(extra) = update.extra {
            node.extra = extra;
        }

        task.save().await?;
        let result = task.node().clone();
        task.release().await?;
        Ok(result)
    }

    #[instrument(skip(self, _ctx))]
    pub async fn change_node_power_state(
        &self,
        _ctx: &RequestContext,
        node_id: i64,
        new_state: PowerState,
    ) -> ConductorResult<()> {
        info!(node_id, ?new_state, "change_node_power_state");
        let mut task = self.tasks.acquire(node_id, false, None).await?;
        task.driver()
            .power
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("power".to_string()))?
            .validate(&task)
            .await?;

        // REBOOT is not a resting state: requesting it always means "end up ON".
        let target = if new_state == PowerState::Reboot {
            PowerState::On
        } else {
            new_state
        };

        let previous_power_state = task.node().power_state;
        task.node_mut().target_power_state = Some(target);
        task.node_mut().last_error.clear();
        task.save().await?;

        let effective_request = new_state;
        let err_handler = move |_err: &ConductorError, task: &mut Task| {
            let node = task.node_mut();
            node.power_state = previous_power_state;
            node.target_power_state = None;
            node.last_error = "No free conductor workers".to_string();
        };

        task.spawn_after(
            &self.pool,
            move |task| async move { node_power_action(task, effective_request).await },
            Some(err_handler),
        )
        .await
    }

    #[instrument(skip(self, _ctx, info))]
    pub async fn vendor_passthru(
        &self,
        _ctx: &RequestContext,
        node_id: i64,
        method: &str,
        http_method: &str,
        info: JsonMap,
    ) -> ConductorResult<(Option<Value>, bool)> {
        // Exclusive: node state must not be allowed to change between
        // vendor.validate and dispatch.
        let task = self.tasks.acquire(node_id, false, None).await?;
        let vendor = task
            .driver()
            .vendor
            .clone()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("vendor".to_string()))?;
        vendor.validate(&task).await?;

        if vendor.has_legacy_vendor_passthru() {
            warn!(method, "driver uses deprecated vendor_passthru interface");
            let vendor = vendor.clone();
            let method = method.to_string();
            task.spawn_after(
                &self.pool,
                move |task| async move {
                    if let Some(Err(err)) = vendor.legacy_vendor_passthru(&task, &method, &info).await {
                        warn!(error = %err, "legacy vendor passthru failed");
                    }
                },
                None::<fn(&ConductorError, &mut Task)>,
            )
            .await?;
            return Ok((None, true));
        }

        let routes = vendor.vendor_routes();
        let route = routes.get(method).ok_or_else(|| {
            ConductorError::InvalidParameterValue(format!("No handler for method {method}"))
        })?;
        if !route.allowed_http_methods.contains(&http_method.to_ascii_uppercase()) {
            return Err(ConductorError::InvalidParameterValue(format!(
                "method {method} does not support HTTP {http_method}"
            )));
        }

        if route.is_async {
            let vendor = vendor.clone();
            let method = method.to_string();
            task.spawn_after(
                &self.pool,
                move |task| async move {
                    if let Err(err) = vendor.call(&task, &method, &info).await {
                        warn!(error = %err, "async vendor passthru failed");
                    }
                },
                None::<fn(&ConductorError, &mut Task)>,
            )
            .await?;
            return Ok((None, true));
        }

        let result = vendor.call(&task, method, &info).await?;
        Ok((Some(result), false))
    }

    #[instrument(skip(self, _ctx, info))]
    pub async fn driver_vendor_passthru(
        &self,
        _ctx: &RequestContext,
        driver_name: &str,
        method: &str,
        http_method: &str,
        info: JsonMap,
    ) -> ConductorResult<(Option<Value>, bool)> {
        let driver = self.drivers.get(driver_name)?;
        let vendor = driver
            .vendor
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("vendor".to_string()))?;

        if let Some(result) = vendor.legacy_driver_vendor_passthru(method, &info).await {
            warn!(method, "driver uses deprecated driver_vendor_passthru interface");
            return Ok((Some(result?), false));
        }

        let routes = vendor.driver_routes();
        let route = routes.get(method).ok_or_else(|| {
            ConductorError::InvalidParameterValue(format!("No handler for method {method}"))
        })?;
        if !route.allowed_http_methods.contains(&http_method.to_ascii_uppercase()) {
            return Err(ConductorError::InvalidParameterValue(format!(
                "method {method} does not support HTTP {http_method}"
            )));
        }

        if route.is_async {
            let vendor = vendor.clone();
            let permit = self.pool.reserve().await?;
            let method = method.to_string();
            self.pool.spawn(permit, async move {
                if let Err(err) = vendor.call_driver(&method, &info).await {
                    warn!(error = %err, "async driver vendor passthru failed");
                }
            });
            return Ok((None, true));
        }

        let result = vendor.call_driver(method, &info).await?;
        Ok((Some(result), false))
    }

    pub async fn get_node_vendor_passthru_methods(
        &self,
        _ctx: &RequestContext,
        node_id: i64,
    ) -> ConductorResult<BTreeMap<String, RouteMetadata>> {
        let task = self.tasks.acquire(node_id, true, None).await?;
        let vendor = task
            .driver()
            .vendor
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("vendor".to_string()))?;
        Ok(route_metadata(vendor.vendor_routes()))
    }

    pub async fn get_driver_vendor_passthru_methods(
        &self,
        _ctx: &RequestContext,
        driver_name: &str,
    ) -> ConductorResult<BTreeMap<String, RouteMetadata>> {
        let driver = self.drivers.get(driver_name)?;
        let vendor = driver
            .vendor
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("vendor".to_string()))?;
        Ok(route_metadata(vendor.driver_routes()))
    }

    #[instrument(skip(self, _ctx))]
    pub async fn do_node_deploy(
        &self,
        _ctx: &RequestContext,
        node_id: i64,
        rebuild: bool,
    ) -> ConductorResult<()> {
        info!(node_id, rebuild, "do_node_deploy");
        let mut task = self.tasks.acquire(node_id, false, None).await?;
        if task.node().maintenance {
            return Err(ConductorError::NodeInMaintenance(node_id.to_string()));
        }
        task.driver()
            .deploy
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("deploy".to_string()))?
            .validate(&task)
            .await?;

        if rebuild {
            task.node_mut().instance_info.remove("kernel");
            task.node_mut().instance_info.remove("ramdisk");
        }

        let event = if rebuild {
            ProvisionEvent::Rebuild
        } else {
            ProvisionEvent::Deploy
        };
        let transition = task.process_event(event).await?;
        debug_assert_eq!(transition.callback, Some(Callback::DoNodeDeploy));

        task.spawn_after(
            &self.pool,
            |task| async move { run_do_node_deploy(task).await },
            None::<fn(&ConductorError, &mut Task)>,
        )
        .await
    }

    #[instrument(skip(self, _ctx))]
    pub async fn do_node_tear_down(&self, _ctx: &RequestContext, node_id: i64) -> ConductorResult<()> {
        info!(node_id, "do_node_tear_down");
        let mut task = self.tasks.acquire(node_id, false, None).await?;
        task.driver()
            .power
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("power".to_string()))?
            .validate(&task)
            .await?;

        let transition = task.process_event(ProvisionEvent::Delete).await?;
        debug_assert_eq!(transition.callback, Some(Callback::DoNodeTearDown));

        task.spawn_after(
            &self.pool,
            |task| async move { run_do_node_tear_down(task).await },
            None::<fn(&ConductorError, &mut Task)>,
        )
        .await
    }

    pub async fn validate_driver_interfaces(
        &self,
        _ctx: &RequestContext,
        node_id: i64,
    ) -> ConductorResult<BTreeMap<String, InterfaceValidation>> {
        let task = self.tasks.acquire(node_id, true, None).await?;
        let driver = task.driver().clone();
        let mut results = BTreeMap::new();

        macro_rules! validate_iface {
            ($name:expr, $iface:expr) => {
                results.insert(
                    $name.to_string(),
                    match &$iface {
                        Some(iface) => match iface.validate(&task).await {
                            Ok(()) => InterfaceValidation {
                                result: true,
                                reason: None,
                            },
                            Err(err) => InterfaceValidation {
                                result: false,
                                reason: Some(err.to_string()),
                            },
                        },
                        None => InterfaceValidation {
                            result: false,
                            reason: Some("not supported by this driver".to_string()),
                        },
                    },
                );
            };
        }

        validate_iface!("power", driver.power);
        validate_iface!("deploy", driver.deploy);
        validate_iface!("management", driver.management);
        validate_iface!("console", driver.console);
        validate_iface!("vendor", driver.vendor);

        Ok(results)
    }

    #[instrument(skip(self, _ctx))]
    pub async fn destroy_node(&self, _ctx: &RequestContext, node_id: i64) -> ConductorResult<()> {
        info!(node_id, "destroy_node");
        let mut task = self.tasks.acquire(node_id, false, None).await?;
        if task.node().is_associated() {
            return Err(ConductorError::NodeAssociated(node_id.to_string()));
        }
        if !task.node().is_powered_down() {
            return Err(ConductorError::NodeInWrongPowerState(node_id.to_string()));
        }

        self.store.destroy_node(node_id).await?;
        task.release().await?;
        Ok(())
    }

    #[instrument(skip(self, _ctx))]
    pub async fn get_console_information(
        &self,
        _ctx: &RequestContext,
        node_id: i64,
    ) -> ConductorResult<JsonMap> {
        let task = self.tasks.acquire(node_id, true, None).await?;
        let console = task
            .driver()
            .console
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("console".to_string()))?;
        console.validate(&task).await?;
        if !task.node().console_enabled {
            return Err(ConductorError::NodeConsoleNotEnabled(node_id.to_string()));
        }
        console.get_console_information(&task).await
    }

    #[instrument(skip(self, _ctx))]
    pub async fn set_console_mode(
        &self,
        _ctx: &RequestContext,
        node_id: i64,
        enabled: bool,
    ) -> ConductorResult<()> {
        info!(node_id, enabled, "set_console_mode");
        let mut task = self.tasks.acquire(node_id, false, None).await?;
        task.driver()
            .console
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("console".to_string()))?
            .validate(&task)
            .await?;

        if task.node().console_enabled == enabled {
            task.release().await?;
            return Ok(());
        }

        task.spawn_after(
            &self.pool,
            move |task| async move { run_set_console_mode(task, enabled).await },
            None::<fn(&ConductorError, &mut Task)>,
        )
        .await
    }

    #[instrument(skip(self, _ctx, port))]
    pub async fn update_port(&self, _ctx: &RequestContext, port: Port) -> ConductorResult<Port> {
        info!(port_id = port.id, "update_port");
        let existing = self.store.get_port(port.id).await?;

        if existing.address != port.address {
            if let Some(vif_port_id) = port.vif_port_id() {
                info!(
                    port_id = port.id,
                    vif_port_id, "updating DHCP provider with new MAC before persisting port"
                );
                // NetworkProvider is out of scope; the update call itself is
                // elided here, matching §9's noted unspecified rollback
                // strategy if persistence below then fails.
            }
        }

        self.store.save_port(&port).await?;
        Ok(port)
    }

    pub async fn get_driver_properties(
        &self,
        _ctx: &RequestContext,
        driver_name: &str,
    ) -> ConductorResult<BTreeMap<String, String>> {
        let driver = self.drivers.get(driver_name)?;
        let management = driver
            .management
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("management".to_string()))?;
        management.get_properties().await
    }

    pub async fn get_boot_device(
        &self,
        _ctx: &RequestContext,
        node_id: i64,
    ) -> ConductorResult<(String, bool)> {
        let task = self.tasks.acquire(node_id, true, None).await?;
        let management = task
            .driver()
            .management
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("management".to_string()))?;
        management.validate(&task).await?;
        management.get_boot_device(&task).await
    }

    pub async fn set_boot_device(
        &self,
        _ctx: &RequestContext,
        node_id: i64,
        device: &str,
        persistent: bool,
    ) -> ConductorResult<()> {
        let task = self.tasks.acquire(node_id, false, None).await?;
        let management = task
            .driver()
            .management
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("management".to_string()))?;
        management.validate(&task).await?;
        management.set_boot_device(&task, device, persistent).await
    }

    pub async fn get_supported_boot_devices(
        &self,
        _ctx: &RequestContext,
        node_id: i64,
    ) -> ConductorResult<Vec<String>> {
        let task = self.tasks.acquire(node_id, true, None).await?;
        let management = task
            .driver()
            .management
            .as_ref()
            .ok_or_else(|| ConductorError::UnsupportedDriverExtension("management".to_string()))?;
        management.get_supported_boot_devices(&task).await
    }
}

/// Partial update accepted by `update_node`. A `None` field is left
/// untouched; `power_state` is always rejected when present (§4.G).
#[derive(Debug, Default, Clone)]
pub struct NodeUpdate {
    pub driver: Option<String>,
    pub power_state: Option<PowerState>,
    pub maintenance: Option<bool>,
    pub maintenance_reason: Option<String>,
    pub instance_info: Option<JsonMap>,
    pub driver_info: Option<JsonMap>,
    pub extra: Option<JsonMap>,
}

#[derive(Debug, Clone)]
pub struct RouteMetadata {
    pub allowed_http_methods: std::collections::BTreeSet<String>,
    pub is_async: bool,
}

fn route_metadata(
    routes: BTreeMap<String, crate::driver::VendorRoute>,
) -> BTreeMap<String, RouteMetadata> {
    routes
        .into_iter()
        .map(|(name, route)| {
            (
                name,
                RouteMetadata {
                    allowed_http_methods: route.allowed_http_methods,
                    is_async: route.is_async,
                },
            )
        })
        .collect()
}

/// Async worker job dispatched by `change_node_power_state`. Drives the
/// hardware to the requested power state and clears the in-flight target on
/// completion, whichever way it goes.
async fn node_power_action(mut task: Task, requested: PowerState) {
    let driver = task.driver().clone();
    let Some(power) = driver.power.clone() else {
        return;
    };

    let outcome = power.set_power_state(&task, requested).await;
    match outcome {
        Ok(()) => {
            task.node_mut().power_state = requested;
            task.node_mut().target_power_state = None;
            task.node_mut().last_error.clear();
        }
        Err(err) => {
            warn!(node_id = task.node().id, error = %err, "power action failed");
            task.node_mut().target_power_state = None;
            task.node_mut().last_error = err.to_string();
        }
    }
    if let Err(err) = task.save().await {
        warn!(error = %err, "failed to persist power action result");
    }
}

/// Async worker job dispatched by `do_node_deploy`. Mirrors the module-level
/// `do_node_deploy` free function in the source: prepare, deploy, then
/// advance the FSM according to whether the driver finished immediately or
/// is waiting on an out-of-band callback.
async fn run_do_node_deploy(mut task: Task) {
    let deploy = task.driver().deploy.clone();
    let Some(deploy) = deploy else {
        return;
    };

    let result: ConductorResult<DeployOutcome> = async {
        deploy.prepare(&task).await?;
        deploy.deploy(&task).await
    }
    .await;

    match result {
        Ok(DeployOutcome::Done) => {
            if let Err(err) = task.process_event(ProvisionEvent::Done).await {
                warn!(error = %err, "failed to advance FSM after deploy completion");
                return;
            }
            let hostname = task.hostname().to_string();
            let node = task.node_mut();
            node.conductor_affinity = Some(hostname);
            node.last_error.clear();
            let _ = task.save().await;
        }
        Ok(DeployOutcome::Wait) => {
            if let Err(err) = task.process_event(ProvisionEvent::Wait).await {
                warn!(error = %err, "failed to advance FSM into DEPLOYWAIT");
            }
        }
        Err(err) => {
            task.node_mut().last_error = err.to_string();
            let _ = task.process_event(ProvisionEvent::Error).await;
        }
    }
}

/// Async worker job dispatched by `do_node_tear_down`.
async fn run_do_node_tear_down(mut task: Task) {
    let deploy = task.driver().deploy.clone();
    if let Some(deploy) = deploy {
        if let Err(err) = deploy.clean_up(&task).await {
            warn!(error = %err, "clean_up failed during tear down");
        }
        let outcome = deploy.tear_down(&task).await;
        if let Err(err) = outcome {
            task.node_mut().instance_info = JsonMap::new();
            task.node_mut().last_error = err.to_string();
            let _ = task.process_event(ProvisionEvent::Error).await;
            return;
        }
    }

    task.node_mut().instance_uuid = None;
    task.node_mut().instance_info = JsonMap::new();
    if let Err(err) = task.process_event(ProvisionEvent::Done).await {
        warn!(error = %err, "failed to advance FSM after tear down");
    }
}

/// Async worker job dispatched by `set_console_mode`.
async fn run_set_console_mode(mut task: Task, enabled: bool) {
    let console = task.driver().console.clone();
    let Some(console) = console else {
        return;
    };

    let result = if enabled {
        console.start_console(&task).await
    } else {
        console.stop_console(&task).await
    };

    match result {
        Ok(()) => {
            task.node_mut().console_enabled = enabled;
            task.node_mut().last_error.clear();
        }
        Err(err) => {
            task.node_mut().last_error = err.to_string();
        }
    }
    if let Err(err) = task.save().await {
        warn!(error = %err, "failed to persist console mode change");
    }
}

/// Async worker job dispatched by `_check_deploy_timeouts` and by the FSM's
/// `DEPLOYWAIT --fail--> DEPLOYFAIL` transition.
pub(super) async fn cleanup_after_timeout(mut task: Task) {
    task.node_mut().last_error = "Timed out waiting for deploy callback".to_string();
    let _ = task.save().await;
}

use super::handlers::cleanup_after_timeout;
use super::ConductorCore;
use crate::error::ConductorError;
use crate::model::{Node, PowerState, ProvisionState};
use crate::state_machine::ProvisionEvent;
use crate::store::{NodeFilter, SortDir};
use crate::task_manager::Task;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub fn spawn_all(core: Arc<ConductorCore>, join_set: &mut JoinSet<()>) {
    join_set.spawn(keepalive_loop(core.clone()));
    join_set.spawn(sync_power_states_loop(core.clone()));
    join_set.spawn(check_deploy_timeouts_loop(core.clone()));
    join_set.spawn(sync_local_state_loop(core.clone()));
    join_set.spawn(send_sensor_data_loop(core));
}

macro_rules! tick_or_stop {
    ($core:expr, $interval:expr) => {{
        tokio::select! {
            _ = $interval.tick() => {}
            _ = $core.shutdown.cancelled() => return,
        }
    }};
}

/// `_conductor_service_record_keepalive`: touches the conductor record every
/// `heartbeat_interval`, tolerating connection errors.
async fn keepalive_loop(core: Arc<ConductorCore>) {
    let mut interval = tokio::time::interval(core.config.heartbeat_interval);
    loop {
        tick_or_stop!(core, interval);
        if let Err(err) = core.store.touch_conductor(&core.hostname).await {
            warn!(error = %err, "keepalive failed, will retry next tick");
        }
    }
}

/// `_sync_power_states`: reconciles recorded power state against hardware
/// for every unreserved, non-maintenance node mapped to this conductor.
async fn sync_power_states_loop(core: Arc<ConductorCore>) {
    let mut interval = tokio::time::interval(core.config.sync_power_state_interval);
    loop {
        tick_or_stop!(core, interval);
        sync_power_states_tick(&core).await;
    }
}

pub(crate) async fn sync_power_states_tick(core: &Arc<ConductorCore>) {
    let filter = NodeFilter {
        reserved: Some(false),
        maintenance: Some(false),
        ..Default::default()
    };
    let nodes = match core.store.get_nodeinfo_list(&filter, None, None).await {
        Ok(nodes) => nodes,
        Err(err) => {
            warn!(error = %err, "failed to list nodes for power sync");
            return;
        }
    };

    for node in nodes {
        sync_power_state_for_node(core, node).await;
        // Unconditional per iteration, mirroring the original's
        // `finally: eventlet.sleep(0)` — must run even when the node was
        // skipped above.
        tokio::task::yield_now().await;
    }
}

/// One node's worth of `sync_power_state_for_node` body, extracted so every
/// early exit (`return` here, formerly `continue` in the caller's loop)
/// still reaches the unconditional yield in `sync_power_states_tick`.
async fn sync_power_state_for_node(core: &Arc<ConductorCore>, node: Node) {
    if !core
        .ring
        .is_mapped_to(&node.driver, &node.uuid, &core.hostname)
        .await
        .unwrap_or(false)
    {
        return;
    }

    // Re-read: avoid racing with a deploy callback that moved the
    // node into DEPLOYWAIT or maintenance since the listing above.
    let fresh = match core.store.get_node(node.id).await {
        Ok(n) => n,
        Err(ConductorError::NodeNotFound(_)) => return,
        Err(err) => {
            warn!(error = %err, "failed to re-read node before power sync");
            return;
        }
    };
    if fresh.provision_state == ProvisionState::DeployWait || fresh.maintenance {
        return;
    }

    let mut task = match core.tasks.acquire(node.id, false, None).await {
        Ok(t) => t,
        Err(err) if err.is_skip_and_continue() => return,
        Err(err) => {
            warn!(error = %err, "failed to acquire task for power sync");
            return;
        }
    };
    if task.node().provision_state == ProvisionState::DeployWait || task.node().maintenance {
        return;
    }

    let count_before = {
        let counts = core.power_state_sync_count.lock().await;
        *counts.get(&node.uuid).unwrap_or(&0)
    };

    let count_after = do_sync_power_state(core, &mut task, count_before).await;

    let mut counts = core.power_state_sync_count.lock().await;
    if count_after == 0 {
        counts.remove(&node.uuid);
    } else {
        counts.insert(node.uuid.clone(), count_after);
    }
}

/// `do_sync_power_state`: the per-node power reconciliation decision (§4.H).
async fn do_sync_power_state(core: &Arc<ConductorCore>, task: &mut Task, count: u32) -> u32 {
    let count = count + 1;
    let Some(power) = task.driver().power.clone() else {
        return 0;
    };

    let recorded = task.node().power_state;
    if recorded == PowerState::NoState {
        if power.validate(task).await.is_err() {
            return 0;
        }
    }

    let hardware_state = match power.get_power_state(task).await {
        Ok(PowerState::Error) | Err(_) => {
            if count > core.config.power_state_sync_max_retries {
                escalate_to_maintenance(
                    task,
                    "power state sync repeatedly failed to read hardware state",
                )
                .await;
                return count;
            }
            return count;
        }
        Ok(state) => state,
    };

    if recorded == PowerState::NoState {
        task.node_mut().power_state = hardware_state;
        let _ = task.save().await;
        return 0;
    }

    if hardware_state == recorded {
        return 0;
    }

    if count > core.config.power_state_sync_max_retries {
        escalate_to_maintenance(
            task,
            &format!(
                "power state sync: hardware reports {:?} but recorded state is {:?}",
                hardware_state, recorded
            ),
        )
        .await;
        return count;
    }

    if core.config.force_power_state_during_sync {
        if let Err(err) = power.set_power_state(task, recorded).await {
            debug!(
                node_id = task.node().id,
                attempts_left = core.config.power_state_sync_max_retries.saturating_sub(count),
                error = %err,
                "failed to force node back to recorded power state"
            );
        }
    } else {
        task.node_mut().power_state = hardware_state;
        let _ = task.save().await;
    }

    count
}

async fn escalate_to_maintenance(task: &mut Task, reason: &str) {
    warn!(node_id = task.node().id, reason, "escalating node to maintenance");
    let node = task.node_mut();
    node.maintenance = true;
    node.maintenance_reason = reason.to_string();
    node.last_error = reason.to_string();
    let _ = task.save().await;
}

/// `_check_deploy_timeouts`: fails deploys stuck past `deploy_callback_timeout`
/// waiting for an out-of-band callback.
async fn check_deploy_timeouts_loop(core: Arc<ConductorCore>) {
    if core.config.deploy_callback_timeout.is_zero() {
        return;
    }

    let mut interval = tokio::time::interval(core.config.check_provision_state_interval);
    loop {
        tick_or_stop!(core, interval);
        check_deploy_timeouts_tick(&core).await;
    }
}

pub(crate) async fn check_deploy_timeouts_tick(core: &Arc<ConductorCore>) {
    let cutoff =
        chrono::Utc::now() - chrono::Duration::from_std(core.config.deploy_callback_timeout).unwrap();
    let filter = NodeFilter {
        provision_state: Some(ProvisionState::DeployWait),
        provisioned_before: Some(cutoff),
        ..Default::default()
    };
    let nodes = match core
        .store
        .get_nodeinfo_list(&filter, Some("provision_updated_at"), Some(SortDir::Asc))
        .await
    {
        Ok(nodes) => nodes,
        Err(err) => {
            warn!(error = %err, "failed to list timed-out deploys");
            return;
        }
    };

    let mut spawned = 0usize;
    for node in nodes {
        if spawned >= core.config.periodic_max_workers {
            break;
        }
        if !core
            .ring
            .is_mapped_to(&node.driver, &node.uuid, &core.hostname)
            .await
            .unwrap_or(false)
        {
            continue;
        }

        let mut task = match core.tasks.acquire(node.id, false, None).await {
            Ok(t) => t,
            Err(err) if err.is_skip_and_continue() => continue,
            Err(err) => {
                warn!(error = %err, "failed to acquire task for deploy timeout check");
                continue;
            }
        };
        if task.node().provision_state != ProvisionState::DeployWait {
            continue;
        }

        if let Err(err) = task.process_event(ProvisionEvent::Fail).await {
            warn!(error = %err, "failed to fail timed-out deploy");
            continue;
        }

        match task
            .spawn_after(&core.pool, cleanup_after_timeout, None::<fn(&ConductorError, &mut Task)>)
            .await
        {
            Ok(()) => spawned += 1,
            Err(err) if err.is_worker_saturation() => break,
            Err(err) => warn!(error = %err, "failed to spawn deploy timeout cleanup"),
        }
    }
}

/// `_sync_local_state`: resets the ring, then takes over nodes whose
/// affinity no longer matches this conductor but are now mapped to it.
async fn sync_local_state_loop(core: Arc<ConductorCore>) {
    let Some(sync_interval) = core.config.sync_local_state_interval else {
        return;
    };

    let mut interval = tokio::time::interval(sync_interval);
    loop {
        tick_or_stop!(core, interval);
        sync_local_state_tick(&core).await;
    }
}

pub(crate) async fn sync_local_state_tick(core: &Arc<ConductorCore>) {
    if let Err(err) = core.ring.reset().await {
        warn!(error = %err, "failed to reset ownership ring");
        return;
    }

    let filter = NodeFilter {
        provision_state: Some(ProvisionState::Active),
        reserved: Some(false),
        maintenance: Some(false),
        ..Default::default()
    };
    let nodes = match core.store.get_nodeinfo_list(&filter, None, None).await {
        Ok(nodes) => nodes,
        Err(err) => {
            warn!(error = %err, "failed to list nodes for local-state sync");
            return;
        }
    };

    let mut spawned = 0usize;
    for node in nodes {
        if spawned >= core.config.periodic_max_workers {
            break;
        }
        if node.conductor_affinity.as_deref() == Some(core.hostname.as_str()) {
            continue;
        }
        if !core
            .ring
            .is_mapped_to(&node.driver, &node.uuid, &core.hostname)
            .await
            .unwrap_or(false)
        {
            continue;
        }

        let task = match core.tasks.acquire(node.id, false, None).await {
            Ok(t) => t,
            Err(err) if err.is_skip_and_continue() => continue,
            Err(err) => {
                warn!(error = %err, "failed to acquire task for takeover");
                continue;
            }
        };

        match task
            .spawn_after(&core.pool, do_takeover, None::<fn(&ConductorError, &mut Task)>)
            .await
        {
            Ok(()) => spawned += 1,
            Err(err) if err.is_worker_saturation() => break,
            Err(err) => warn!(error = %err, "failed to spawn takeover"),
        }
    }
}

/// `_do_takeover`: does not fire any FSM event, per the source (§9, open
/// question) — it only reassigns `conductor_affinity` after re-priming the
/// deploy driver's local state.
async fn do_takeover(mut task: Task) {
    let hostname = task.hostname().to_string();
    let Some(deploy) = task.driver().deploy.clone() else {
        return;
    };

    if let Err(err) = deploy.prepare(&task).await {
        warn!(error = %err, "takeover prepare failed");
        return;
    }
    if let Err(err) = deploy.take_over(&task).await {
        warn!(error = %err, "takeover failed");
        return;
    }

    task.node_mut().conductor_affinity = Some(hostname);
    let _ = task.save().await;
}

/// `_send_sensor_data`: emits sensor telemetry for associated nodes mapped
/// to this conductor, filtered by the configured allow-list.
async fn send_sensor_data_loop(core: Arc<ConductorCore>) {
    if !core.config.send_sensor_data {
        return;
    }

    let mut interval = tokio::time::interval(core.config.send_sensor_data_interval);
    loop {
        tick_or_stop!(core, interval);
        send_sensor_data_tick(&core).await;
    }
}

pub(crate) async fn send_sensor_data_tick(core: &Arc<ConductorCore>) {
    let filter = NodeFilter {
        associated: Some(true),
        ..Default::default()
    };
    let nodes = match core.store.get_nodeinfo_list(&filter, None, None).await {
        Ok(nodes) => nodes,
        Err(err) => {
            warn!(error = %err, "failed to list nodes for sensor data");
            return;
        }
    };

    for node in nodes {
        send_sensor_data_for_node(core, node).await;
        // Unconditional per iteration, mirroring the original's
        // `finally: eventlet.sleep(0)` — must run even when the node was
        // skipped above.
        tokio::task::yield_now().await;
    }
}

/// One node's worth of `send_sensor_data_tick` body, extracted so every
/// early exit (`return` here, formerly `continue` in the caller's loop)
/// still reaches the unconditional yield in `send_sensor_data_tick`.
async fn send_sensor_data_for_node(core: &Arc<ConductorCore>, node: Node) {
    if !core
        .ring
        .is_mapped_to(&node.driver, &node.uuid, &core.hostname)
        .await
        .unwrap_or(false)
    {
        return;
    }

    let task = match core.tasks.acquire(node.id, true, None).await {
        Ok(t) => t,
        Err(err) if err.is_skip_and_continue() => return,
        Err(err) => {
            warn!(error = %err, "failed to acquire task for sensor data");
            return;
        }
    };

    let Some(management) = task.driver().management.clone() else {
        return;
    };
    if let Err(err) = management.validate(&task).await {
        info!(node_id = task.node().id, error = %err, "sensor data validation failed, skipping");
        return;
    }
    let sensors = match management.get_sensors_data(&task).await {
        Ok(data) => data,
        Err(err) => {
            info!(node_id = task.node().id, error = %err, "sensor data unavailable, skipping");
            return;
        }
    };

    let filtered = filter_sensor_types(sensors, &core.config.send_sensor_data_types);
    if !filtered.is_empty() {
        let notification = crate::notifications::SensorNotification::new(
            task.node().uuid.clone(),
            task.node().instance_uuid.clone(),
            filtered,
        );
        core.notifications.send_sensor_data(notification).await;
    }
}

fn filter_sensor_types(sensors: crate::model::JsonMap, allow_list: &[String]) -> crate::model::JsonMap {
    let allow_all = allow_list.iter().any(|t| t.eq_ignore_ascii_case("all"));
    if allow_all {
        return sensors;
    }
    sensors
        .into_iter()
        .filter(|(sensor_type, _)| {
            allow_list
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(sensor_type))
        })
        .collect()
}

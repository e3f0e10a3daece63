use async_trait::async_trait;
use conductor::bootstrap::Services;
use conductor::config::ConductorConfig;
use conductor::core::{ConductorCore, NodeUpdate};
use conductor::driver::{
    ConsoleInterface, DeployInterface, DeployOutcome, Driver, PowerInterface, VendorInterface,
    VendorRoute,
};
use conductor::error::{ConductorError, ConductorResult};
use conductor::model::{JsonMap, Node, PowerState, ProvisionState};
use conductor::notifications::CapturingNotificationSink;
use conductor::rpc::{RequestContext, TokenSecret};
use conductor::store::memory::InMemoryStore;
use conductor::store::Store;
use conductor::task_manager::Task;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_r::test;

test_r::enable!();

fn make_node(uuid: &str, driver: &str, provision_state: ProvisionState) -> Node {
    Node {
        id: 0,
        uuid: uuid.to_string(),
        driver: driver.to_string(),
        power_state: PowerState::Off,
        target_power_state: None,
        provision_state,
        target_provision_state: None,
        maintenance: false,
        maintenance_reason: String::new(),
        reservation: None,
        conductor_affinity: None,
        instance_uuid: None,
        instance_info: JsonMap::new(),
        driver_info: JsonMap::new(),
        extra: JsonMap::new(),
        last_error: String::new(),
        console_enabled: false,
        provision_updated_at: None,
    }
}

fn ctx() -> RequestContext {
    RequestContext::new(TokenSecret::new("test-token"), true)
}

async fn build_core(
    hostname: &str,
    config: ConductorConfig,
    driver: Arc<Driver>,
) -> (Arc<ConductorCore>, Arc<InMemoryStore>, Arc<CapturingNotificationSink>) {
    let store = Arc::new(InMemoryStore::new());
    let notifications = Arc::new(CapturingNotificationSink::new());
    let services = Services::new(
        hostname.to_string(),
        config,
        store.clone(),
        vec![driver],
        notifications.clone(),
    )
    .await
    .expect("services should wire up");
    (services.core, store, notifications)
}

/// Polls `check` up to a second, sleeping between attempts. Used to observe
/// the result of work dispatched onto the worker pool, which runs on a
/// separately-scheduled task.
async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within the deadline");
}

#[derive(Default)]
struct FakePower {
    state: Mutex<PowerState>,
    fail_get: Mutex<bool>,
    set_calls: AtomicUsize,
}

impl FakePower {
    fn new(initial: PowerState) -> Self {
        Self {
            state: Mutex::new(initial),
            fail_get: Mutex::new(false),
            set_calls: AtomicUsize::new(0),
        }
    }

    fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PowerInterface for FakePower {
    async fn validate(&self, _task: &Task) -> ConductorResult<()> {
        Ok(())
    }

    async fn get_power_state(&self, _task: &Task) -> ConductorResult<PowerState> {
        if *self.fail_get.lock().unwrap() {
            return Err(ConductorError::PowerStateFailure("simulated read failure".to_string()));
        }
        Ok(*self.state.lock().unwrap())
    }

    async fn set_power_state(&self, _task: &Task, state: PowerState) -> ConductorResult<()> {
        // Simulate the hardware call taking long enough for a racing
        // reservation request to observe the worker pool as saturated.
        tokio::time::sleep(Duration::from_millis(60)).await;
        *self.state.lock().unwrap() = state;
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeDeploy {
    outcome: Mutex<DeployOutcome>,
    fail_deploy: Mutex<bool>,
    deploy_calls: AtomicUsize,
    tear_down_calls: AtomicUsize,
    take_over_calls: AtomicUsize,
}

impl FakeDeploy {
    fn new(outcome: DeployOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            fail_deploy: Mutex::new(false),
            deploy_calls: AtomicUsize::new(0),
            tear_down_calls: AtomicUsize::new(0),
            take_over_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DeployInterface for FakeDeploy {
    async fn validate(&self, _task: &Task) -> ConductorResult<()> {
        Ok(())
    }

    async fn prepare(&self, _task: &Task) -> ConductorResult<()> {
        Ok(())
    }

    async fn deploy(&self, _task: &Task) -> ConductorResult<DeployOutcome> {
        self.deploy_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_deploy.lock().unwrap() {
            return Err(ConductorError::InstanceDeployFailure("simulated deploy failure".to_string()));
        }
        Ok(*self.outcome.lock().unwrap())
    }

    async fn clean_up(&self, _task: &Task) -> ConductorResult<()> {
        Ok(())
    }

    async fn tear_down(&self, _task: &Task) -> ConductorResult<()> {
        self.tear_down_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn take_over(&self, _task: &Task) -> ConductorResult<()> {
        self.take_over_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeVendor {
    call_count: AtomicUsize,
}

#[async_trait]
impl VendorInterface for FakeVendor {
    async fn validate(&self, _task: &Task) -> ConductorResult<()> {
        Ok(())
    }

    fn vendor_routes(&self) -> BTreeMap<String, VendorRoute> {
        let mut routes = BTreeMap::new();
        routes.insert(
            "get_status".to_string(),
            VendorRoute {
                allowed_http_methods: BTreeSet::from(["GET".to_string()]),
                is_async: false,
            },
        );
        routes.insert(
            "async_action".to_string(),
            VendorRoute {
                allowed_http_methods: BTreeSet::from(["POST".to_string()]),
                is_async: true,
            },
        );
        routes
    }

    fn driver_routes(&self) -> BTreeMap<String, VendorRoute> {
        BTreeMap::new()
    }

    async fn call(&self, _task: &Task, _method: &str, _info: &JsonMap) -> ConductorResult<serde_json::Value> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({"status": "ok"}))
    }

    async fn call_driver(&self, _method: &str, _info: &JsonMap) -> ConductorResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}

struct FakeConsole {
    started: AtomicUsize,
}

impl Default for FakeConsole {
    fn default() -> Self {
        Self {
            started: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ConsoleInterface for FakeConsole {
    async fn validate(&self, _task: &Task) -> ConductorResult<()> {
        Ok(())
    }

    async fn start_console(&self, _task: &Task) -> ConductorResult<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_console(&self, _task: &Task) -> ConductorResult<()> {
        Ok(())
    }

    async fn get_console_information(&self, _task: &Task) -> ConductorResult<JsonMap> {
        let mut info = JsonMap::new();
        info.insert("url".to_string(), serde_json::Value::String("console://fake".to_string()));
        Ok(info)
    }
}

/// Scenario: a node in AVAILABLE deploys cleanly and lands in ACTIVE with its
/// affinity pointed at the conductor that ran the deploy.
#[test]
async fn happy_deploy_path_reaches_active() {
    let power = Arc::new(FakePower::new(PowerState::Off));
    let deploy = Arc::new(FakeDeploy::new(DeployOutcome::Done));
    let driver = Arc::new(
        Driver::new("fake")
            .with_power(power.clone())
            .with_deploy(deploy.clone()),
    );
    let (core, store, _notifications) = build_core("conductor-1", ConductorConfig::default(), driver).await;

    let node_id = store.insert_node(make_node("node-1", "fake", ProvisionState::Available));

    core.do_node_deploy(&ctx(), node_id, false).await.unwrap();

    wait_until(|| deploy.deploy_calls.load(Ordering::SeqCst) == 1).await;
    let node = store.get_node(node_id).await.unwrap();
    assert_eq!(node.provision_state, ProvisionState::Active);
    assert_eq!(node.target_provision_state, None);
    assert_eq!(node.conductor_affinity.as_deref(), Some("conductor-1"));
    assert!(node.last_error.is_empty());
}

/// Scenario: a deploy that needs an out-of-band callback parks in
/// DEPLOYWAIT, and `_check_deploy_timeouts` fails it once its callback
/// deadline has passed.
#[test]
async fn deploy_wait_then_timeout_fails_the_node() {
    let power = Arc::new(FakePower::new(PowerState::Off));
    let deploy = Arc::new(FakeDeploy::new(DeployOutcome::Wait));
    let driver = Arc::new(
        Driver::new("fake")
            .with_power(power)
            .with_deploy(deploy.clone()),
    );
    let config = ConductorConfig {
        deploy_callback_timeout: Duration::from_millis(1),
        ..ConductorConfig::default()
    };
    let (core, store, _notifications) = build_core("conductor-1", config, driver).await;

    let node_id = store.insert_node(make_node("node-2", "fake", ProvisionState::Available));

    core.do_node_deploy(&ctx(), node_id, false).await.unwrap();
    wait_until(|| deploy.deploy_calls.load(Ordering::SeqCst) == 1).await;

    let node = store.get_node(node_id).await.unwrap();
    assert_eq!(node.provision_state, ProvisionState::DeployWait);

    tokio::time::sleep(Duration::from_millis(20)).await;
    core.run_check_deploy_timeouts_once().await;

    let node = store.get_node(node_id).await.unwrap();
    assert_eq!(node.provision_state, ProvisionState::DeployFail);

    let mut attempts_left = 200;
    loop {
        if !store.get_node(node_id).await.unwrap().last_error.is_empty() {
            break;
        }
        attempts_left -= 1;
        assert!(attempts_left > 0, "cleanup_after_timeout never set last_error");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Scenario: when the worker pool is saturated, `change_node_power_state`
/// rejects the second request and rolls the node back to its pre-request
/// power state instead of leaving a dangling target.
#[test]
async fn spawn_saturation_rolls_back_power_state() {
    let power = Arc::new(FakePower::new(PowerState::Off));
    let driver = Arc::new(Driver::new("fake").with_power(power.clone()));
    let config = ConductorConfig {
        workers_pool_size: 1,
        ..ConductorConfig::default()
    };
    let (core, store, _notifications) = build_core("conductor-1", config, driver).await;

    let node_a = store.insert_node(make_node("node-a", "fake", ProvisionState::Available));
    let node_b = store.insert_node(make_node("node-b", "fake", ProvisionState::Available));

    core.change_node_power_state(&ctx(), node_a, PowerState::On)
        .await
        .expect("first request should take the only worker slot");

    let err = core
        .change_node_power_state(&ctx(), node_b, PowerState::On)
        .await
        .expect_err("second request should find the pool saturated");
    assert!(matches!(err, ConductorError::NoFreeConductorWorker));

    let node_b_after = store.get_node(node_b).await.unwrap();
    assert_eq!(node_b_after.power_state, PowerState::Off);
    assert_eq!(node_b_after.target_power_state, None);
    assert_eq!(node_b_after.last_error, "No free conductor workers");

    wait_until(|| power.set_calls() == 1).await;
    let node_a_after = store.get_node(node_a).await.unwrap();
    assert_eq!(node_a_after.power_state, PowerState::On);
}

/// Scenario: recorded power state drifts from the hardware; with
/// `force_power_state_during_sync` the conductor pushes the hardware back
/// to the recorded state, and repeated drift eventually escalates the node
/// to maintenance.
#[test]
async fn power_sync_forces_then_escalates_on_persistent_drift() {
    let power = Arc::new(FakePower::new(PowerState::Off));
    let driver = Arc::new(Driver::new("fake").with_power(power.clone()));
    let config = ConductorConfig {
        force_power_state_during_sync: true,
        power_state_sync_max_retries: 2,
        ..ConductorConfig::default()
    };
    let (core, store, _notifications) = build_core("conductor-1", config, driver).await;

    let mut node = make_node("node-3", "fake", ProvisionState::Active);
    node.power_state = PowerState::On;
    let node_id = store.insert_node(node);

    for _ in 0..4 {
        core.run_sync_power_states_once().await;
    }

    assert!(power.set_calls() >= 1);
    let node = store.get_node(node_id).await.unwrap();
    assert!(node.maintenance, "persistent drift should escalate to maintenance");
    assert!(!node.last_error.is_empty());
}

/// Scenario: `destroy_node` refuses an associated node, then refuses a
/// powered-on node, and only succeeds once both conditions clear.
#[test]
async fn destroy_refused_until_unassociated_and_powered_down() {
    let power = Arc::new(FakePower::new(PowerState::On));
    let driver = Arc::new(Driver::new("fake").with_power(power));
    let (core, store, _notifications) = build_core("conductor-1", ConductorConfig::default(), driver).await;

    let mut node = make_node("node-4", "fake", ProvisionState::Available);
    node.instance_uuid = Some("instance-1".to_string());
    node.power_state = PowerState::On;
    let node_id = store.insert_node(node);

    let err = core.destroy_node(&ctx(), node_id).await.unwrap_err();
    assert!(matches!(err, ConductorError::NodeAssociated(_)));

    let mut node = store.get_node(node_id).await.unwrap();
    node.instance_uuid = None;
    store.save_node(&node).await.unwrap();

    let err = core.destroy_node(&ctx(), node_id).await.unwrap_err();
    assert!(matches!(err, ConductorError::NodeInWrongPowerState(_)));

    let mut node = store.get_node(node_id).await.unwrap();
    node.power_state = PowerState::Off;
    store.save_node(&node).await.unwrap();

    core.destroy_node(&ctx(), node_id).await.unwrap();
    assert!(matches!(
        store.get_node(node_id).await.unwrap_err(),
        ConductorError::NodeNotFound(_)
    ));
}

/// Scenario: a node whose recorded affinity belongs to another conductor,
/// but is now mapped to us, gets taken over without firing an FSM event.
#[test]
async fn takeover_reassigns_affinity_without_fsm_event() {
    let power = Arc::new(FakePower::new(PowerState::On));
    let deploy = Arc::new(FakeDeploy::new(DeployOutcome::Done));
    let driver = Arc::new(
        Driver::new("fake")
            .with_power(power)
            .with_deploy(deploy.clone()),
    );
    let (core, store, _notifications) = build_core("conductor-1", ConductorConfig::default(), driver).await;

    let mut node = make_node("node-5", "fake", ProvisionState::Active);
    node.power_state = PowerState::On;
    node.conductor_affinity = Some("stale-conductor".to_string());
    let node_id = store.insert_node(node);

    core.run_sync_local_state_once().await;

    wait_until(|| deploy.take_over_calls.load(Ordering::SeqCst) == 1).await;
    let node = store.get_node(node_id).await.unwrap();
    assert_eq!(node.conductor_affinity.as_deref(), Some("conductor-1"));
    assert_eq!(node.provision_state, ProvisionState::Active);
}

/// `update_node` never accepts a direct `power_state` write; that field is
/// only mutated by the power-action worker.
#[test]
async fn update_node_rejects_direct_power_state_write() {
    let power = Arc::new(FakePower::new(PowerState::Off));
    let driver = Arc::new(Driver::new("fake").with_power(power));
    let (core, store, _notifications) = build_core("conductor-1", ConductorConfig::default(), driver).await;

    let node_id = store.insert_node(make_node("node-6", "fake", ProvisionState::Available));

    let err = core
        .update_node(
            &ctx(),
            node_id,
            NodeUpdate {
                power_state: Some(PowerState::On),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::InvalidParameterValue(_)));
}

/// Vendor passthru dispatches known, allowed methods and rejects both
/// unknown methods and disallowed HTTP verbs.
#[test]
async fn vendor_passthru_enforces_routing_table() {
    let power = Arc::new(FakePower::new(PowerState::Off));
    let vendor = Arc::new(FakeVendor::default());
    let driver = Arc::new(
        Driver::new("fake")
            .with_power(power)
            .with_vendor(vendor.clone()),
    );
    let (core, store, _notifications) = build_core("conductor-1", ConductorConfig::default(), driver).await;

    let node_id = store.insert_node(make_node("node-7", "fake", ProvisionState::Available));

    let (result, is_async) = core
        .vendor_passthru(&ctx(), node_id, "get_status", "GET", JsonMap::new())
        .await
        .unwrap();
    assert_eq!(result, Some(serde_json::json!({"status": "ok"})));
    assert!(!is_async);
    assert_eq!(vendor.call_count.load(Ordering::SeqCst), 1);

    let err = core
        .vendor_passthru(&ctx(), node_id, "get_status", "POST", JsonMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::InvalidParameterValue(_)));

    let err = core
        .vendor_passthru(&ctx(), node_id, "no_such_method", "GET", JsonMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::InvalidParameterValue(_)));

    // An `is_async` route must return immediately with no result, and only
    // actually run on the worker pool.
    let (result, is_async) = core
        .vendor_passthru(&ctx(), node_id, "async_action", "POST", JsonMap::new())
        .await
        .unwrap();
    assert_eq!(result, None);
    assert!(is_async);
    wait_until(|| vendor.call_count.load(Ordering::SeqCst) == 2).await;
}

/// `set_console_mode` short-circuits to a plain release when the requested
/// mode already matches, and otherwise dispatches to the worker pool.
#[test]
async fn set_console_mode_short_circuits_on_no_op() {
    let power = Arc::new(FakePower::new(PowerState::Off));
    let console = Arc::new(FakeConsole::default());
    let driver = Arc::new(
        Driver::new("fake")
            .with_power(power)
            .with_console(console.clone()),
    );
    let (core, store, _notifications) = build_core("conductor-1", ConductorConfig::default(), driver).await;

    let node_id = store.insert_node(make_node("node-8", "fake", ProvisionState::Available));

    core.set_console_mode(&ctx(), node_id, false).await.unwrap();
    assert_eq!(console.started.load(Ordering::SeqCst), 0);

    core.set_console_mode(&ctx(), node_id, true).await.unwrap();
    wait_until(|| console.started.load(Ordering::SeqCst) == 1).await;
    let node = store.get_node(node_id).await.unwrap();
    assert!(node.console_enabled);
}

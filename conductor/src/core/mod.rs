mod handlers;
mod periodic;

pub use handlers::{InterfaceValidation, NodeUpdate, RouteMetadata};

use crate::config::ConductorConfig;
use crate::driver::DriverRegistry;
use crate::notifications::NotificationSink;
use crate::ring::RingManager;
use crate::store::Store;
use crate::task_manager::{TaskManager, TaskManagerConfig};
use crate::worker_pool::WorkerPool;
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the conductor's lifecycle and exposes the RPC handler surface
/// (§4.G). Orchestrates the DriverRegistry, RingManager, TaskManager,
/// WorkerPool, and StateMachine, and drives the periodic reconciliation
/// loops (§4.H).
pub struct ConductorCore {
    pub(crate) hostname: String,
    pub(crate) config: ConductorConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) drivers: Arc<DriverRegistry>,
    pub(crate) ring: Arc<RingManager>,
    pub(crate) tasks: Arc<TaskManager>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) notifications: Arc<dyn NotificationSink>,
    /// In-process retry counter for `_sync_power_states`, keyed by node
    /// uuid. Process-local by design (§9 "Global counter map"); only the
    /// power-sync loop touches it, and that loop is single-flighted per
    /// conductor, so a plain mutex is sufficient.
    pub(crate) power_state_sync_count: Mutex<HashMap<String, u32>>,
    pub(crate) shutdown: CancellationToken,
}

impl ConductorCore {
    pub fn new(
        hostname: String,
        config: ConductorConfig,
        store: Arc<dyn Store>,
        drivers: Arc<DriverRegistry>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let heartbeat_timeout = ChronoDuration::from_std(config.heartbeat_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        let ring = Arc::new(RingManager::new(
            store.clone(),
            heartbeat_timeout,
            config.ring_replica_count,
        ));
        let tasks = Arc::new(TaskManager::new(
            store.clone(),
            drivers.clone(),
            hostname.clone(),
            TaskManagerConfig {
                node_locked_retry_attempts: config.node_locked_retry_attempts,
                node_locked_retry_interval: config.node_locked_retry_interval,
            },
        ));
        let pool = Arc::new(WorkerPool::new(config.workers_pool_size));

        Self {
            hostname,
            config,
            store,
            drivers,
            ring,
            tasks,
            pool,
            notifications,
            power_state_sync_count: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Registers this conductor, clears any reservations left over from an
    /// unclean shutdown under the same hostname, and primes the ownership
    /// ring. Per §8's round-trip property, reservations held by this
    /// hostname are zero once this returns.
    pub async fn init_host(&self) -> crate::error::ConductorResult<()> {
        info!(hostname = %self.hostname, "registering conductor");
        let register_result = self
            .store
            .register_conductor(&self.hostname, self.drivers.supported_driver_names(), false)
            .await;
        match register_result {
            Ok(_) => {}
            Err(crate::error::ConductorError::ConductorAlreadyRegistered(_)) => {
                warn!(
                    hostname = %self.hostname,
                    "conductor already registered, likely restarting after an unclean shutdown"
                );
                self.store
                    .register_conductor(&self.hostname, self.drivers.supported_driver_names(), true)
                    .await?;
            }
            Err(err) => return Err(err),
        }

        let cleared = self.store.clear_reservations_for(&self.hostname).await?;
        if cleared > 0 {
            info!(
                hostname = %self.hostname,
                cleared,
                "cleared stale reservations from a previous run"
            );
        }

        self.ring.reset().await?;
        Ok(())
    }

    /// Signals all periodic loops to stop, waits for the worker pool to
    /// drain, and deregisters this conductor.
    pub async fn del_host(&self) -> crate::error::ConductorResult<()> {
        info!(hostname = %self.hostname, "deregistering conductor");
        self.shutdown.cancel();
        self.pool.wait_all().await;
        self.store.unregister_conductor(&self.hostname).await?;
        Ok(())
    }

    /// Spawns the five periodic loops (§4.H) onto the given join set.
    pub fn run_periodic_loops(self: &Arc<Self>, join_set: &mut JoinSet<()>) {
        periodic::spawn_all(self.clone(), join_set);
    }

    /// Runs one iteration of `_sync_power_states` outside of its timer loop.
    /// Exposed so the reconciliation logic can be driven deterministically
    /// in tests instead of waiting on `sync_power_state_interval`.
    pub async fn run_sync_power_states_once(self: &Arc<Self>) {
        periodic::sync_power_states_tick(self).await;
    }

    /// Runs one iteration of `_check_deploy_timeouts` outside of its timer loop.
    pub async fn run_check_deploy_timeouts_once(self: &Arc<Self>) {
        periodic::check_deploy_timeouts_tick(self).await;
    }

    /// Runs one iteration of `_sync_local_state` outside of its timer loop.
    pub async fn run_sync_local_state_once(self: &Arc<Self>) {
        periodic::sync_local_state_tick(self).await;
    }

    /// Runs one iteration of `_send_sensor_data` outside of its timer loop.
    pub async fn run_send_sensor_data_once(self: &Arc<Self>) {
        periodic::send_sensor_data_tick(self).await;
    }
}

use crate::driver::{Driver, DriverRegistry};
use crate::error::{ConductorError, ConductorResult};
use crate::model::Node;
use crate::state_machine::{self, Callback, ProvisionEvent, Transition};
use crate::store::Store;
use crate::worker_pool::WorkerPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub node_locked_retry_attempts: u32,
    pub node_locked_retry_interval: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            node_locked_retry_attempts: 3,
            node_locked_retry_interval: Duration::from_secs(1),
        }
    }
}

/// Acquires per-node tasks (§4.D). Exclusive acquisition takes the DB
/// reservation with bounded retry; shared acquisition takes a read-only
/// snapshot and never touches the reservation.
pub struct TaskManager {
    store: Arc<dyn Store>,
    drivers: Arc<DriverRegistry>,
    hostname: String,
    config: TaskManagerConfig,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn Store>,
        drivers: Arc<DriverRegistry>,
        hostname: String,
        config: TaskManagerConfig,
    ) -> Self {
        Self {
            store,
            drivers,
            hostname,
            config,
        }
    }

    pub async fn acquire(
        &self,
        node_id: i64,
        shared: bool,
        driver_name: Option<&str>,
    ) -> ConductorResult<Task> {
        let node = self.store.get_node(node_id).await?;
        let driver_name = driver_name.unwrap_or(&node.driver);
        let driver = self.drivers.get(driver_name)?;

        if !shared {
            self.reserve_with_retry(node_id).await?;
        }

        Ok(Task {
            node,
            driver,
            shared,
            store: self.store.clone(),
            hostname: self.hostname.clone(),
            released: false,
            handed_off: false,
        })
    }

    async fn reserve_with_retry(&self, node_id: i64) -> ConductorResult<()> {
        let mut attempt = 0;
        loop {
            match self.store.reserve_node(&self.hostname, node_id).await {
                Ok(()) => return Ok(()),
                Err(ConductorError::NodeLocked(_)) if attempt < self.config.node_locked_retry_attempts => {
                    attempt += 1;
                    debug!(node_id, attempt, "node locked, retrying acquisition");
                    tokio::time::sleep(self.config.node_locked_retry_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// A scoped handle on a single node (§GLOSSARY "Task"). Exclusive tasks hold
/// the DB reservation until released, handed off to a worker via
/// `spawn_after`, or dropped (in which case release happens best-effort in
/// the background and a warning is logged, since `Drop` cannot await).
pub struct Task {
    node: Node,
    driver: Arc<Driver>,
    shared: bool,
    store: Arc<dyn Store>,
    hostname: String,
    released: bool,
    handed_off: bool,
}

impl Task {
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Persists the current in-memory node to the store.
    pub async fn save(&self) -> ConductorResult<()> {
        self.store.save_node(&self.node).await
    }

    /// Releases the reservation early, e.g. for the `set_console_mode`
    /// no-op path. Safe to call more than once.
    pub async fn release(&mut self) -> ConductorResult<()> {
        if self.shared || self.released || self.handed_off {
            self.released = true;
            return Ok(());
        }
        self.store.release_node(&self.hostname, self.node.id).await?;
        self.released = true;
        Ok(())
    }

    /// Advances the provisioning FSM, persists the resulting node, and
    /// returns the decided transition so the caller can dispatch its
    /// callback (if any) via `spawn_after` under the same held lock.
    pub async fn process_event(&mut self, event: ProvisionEvent) -> ConductorResult<Transition> {
        let t = state_machine::transition(self.node.provision_state, event)?;
        self.node.provision_state = t.next_state;
        self.node.target_provision_state = t.next_target;
        self.node.provision_updated_at = Some(chrono::Utc::now());
        self.save().await?;
        Ok(t)
    }

    /// Hands this task off to the worker pool. On success the reservation's
    /// release becomes the spawned job's responsibility. On saturation, the
    /// task is returned to the caller (via `self` staying owned) after
    /// `err_handler` has had a chance to roll back in-memory+persisted
    /// state, matching the source's "error hook runs before release".
    pub async fn spawn_after<F, Fut, E>(
        mut self,
        pool: &WorkerPool,
        job: F,
        err_handler: Option<E>,
    ) -> ConductorResult<()>
    where
        F: FnOnce(Task) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        E: FnOnce(&ConductorError, &mut Task) + Send,
    {
        match pool.reserve().await {
            Ok(permit) => {
                self.handed_off = true;
                pool.spawn(permit, async move {
                    job(self).await;
                });
                Ok(())
            }
            Err(err) => {
                if let Some(handler) = err_handler {
                    handler(&err, &mut self);
                    if let Err(save_err) = self.save().await {
                        warn!(error = %save_err, "failed to persist rollback after spawn failure");
                    }
                }
                Err(err)
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if self.shared || self.released || self.handed_off {
            return;
        }
        let store = self.store.clone();
        let hostname = self.hostname.clone();
        let node_id = self.node.id;
        warn!(
            node_id,
            "task dropped without explicit release; releasing in background"
        );
        tokio::spawn(async move {
            if let Err(err) = store.release_node(&hostname, node_id).await {
                warn!(node_id, error = %err, "background release failed");
            }
        });
    }
}

/// Short-circuits `Callback::DoNodeDeploy`/`DoNodeTearDown`/
/// `CleanupAfterTimeout` dispatch bookkeeping shared by the handlers and
/// periodic loops.
pub fn callback_name(callback: Callback) -> &'static str {
    match callback {
        Callback::DoNodeDeploy => "do_node_deploy",
        Callback::DoNodeTearDown => "do_node_tear_down",
        Callback::CleanupAfterTimeout => "cleanup_after_timeout",
    }
}

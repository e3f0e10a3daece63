use crate::error::ConductorResult;
use crate::store::Store;
use chrono::Duration;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

const VIRTUAL_NODES_PER_HOST: u32 = 32;

/// Consistent-hash ring over a single driver's live conductors (§4.B).
/// Deliberately eventually consistent: the DB reservation, not the ring, is
/// the canonical arbiter of who may write a node.
#[derive(Default, Clone)]
struct HashRing {
    points: BTreeMap<u64, String>,
}

impl HashRing {
    fn build(hosts: impl IntoIterator<Item = String>) -> Self {
        let mut points = BTreeMap::new();
        for host in hosts {
            for replica in 0..VIRTUAL_NODES_PER_HOST {
                let mut hasher = DefaultHasher::new();
                (host.as_str(), replica).hash(&mut hasher);
                points.insert(hasher.finish(), host.clone());
            }
        }
        Self { points }
    }

    fn get_hosts(&self, key: &str, replica_count: usize) -> Vec<String> {
        if self.points.is_empty() || replica_count == 0 {
            return Vec::new();
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let target = hasher.finish();

        let mut ordered = Vec::new();
        for (_, host) in self.points.range(target..).chain(self.points.iter()) {
            if !ordered.contains(host) {
                ordered.push(host.clone());
            }
            if ordered.len() >= replica_count {
                break;
            }
        }
        ordered
    }
}

/// Per-driver set of rings, refreshed from the conductor registration table.
pub struct RingManager {
    store: Arc<dyn Store>,
    heartbeat_timeout: Duration,
    replica_count: usize,
    rings: RwLock<HashMap<String, HashRing>>,
}

impl RingManager {
    pub fn new(store: Arc<dyn Store>, heartbeat_timeout: Duration, replica_count: usize) -> Self {
        Self {
            store,
            heartbeat_timeout,
            replica_count,
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds every per-driver ring from the current conductor population.
    /// Called at the top of `sync_local_state` and lazily on lookup miss.
    pub async fn reset(&self) -> ConductorResult<()> {
        let conductors = self.store.list_conductors().await?;
        let now = chrono::Utc::now();

        let mut by_driver: HashMap<String, Vec<String>> = HashMap::new();
        for conductor in conductors {
            if !conductor.is_alive(now, self.heartbeat_timeout) {
                continue;
            }
            for driver in &conductor.drivers {
                by_driver
                    .entry(driver.clone())
                    .or_default()
                    .push(conductor.hostname.clone());
            }
        }

        let mut rings = HashMap::new();
        for (driver, hosts) in by_driver {
            rings.insert(driver, HashRing::build(hosts));
        }

        debug!(driver_count = rings.len(), "rebuilt ownership ring");
        *self.rings.write().await = rings;
        Ok(())
    }

    pub async fn get_hosts(&self, driver: &str, node_uuid: &str) -> ConductorResult<Vec<String>> {
        {
            let rings = self.rings.read().await;
            if let Some(ring) = rings.get(driver) {
                return Ok(ring.get_hosts(node_uuid, self.replica_count));
            }
        }
        self.reset().await?;
        let rings = self.rings.read().await;
        Ok(rings
            .get(driver)
            .map(|ring| ring.get_hosts(node_uuid, self.replica_count))
            .unwrap_or_default())
    }

    /// Is `hostname` one of the live conductors this node's driver ring
    /// assigns work to?
    pub async fn is_mapped_to(
        &self,
        driver: &str,
        node_uuid: &str,
        hostname: &str,
    ) -> ConductorResult<bool> {
        Ok(self
            .get_hosts(driver, node_uuid)
            .await?
            .iter()
            .any(|h| h == hostname))
    }
}

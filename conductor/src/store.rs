use crate::error::{ConductorError, ConductorResult};
use crate::model::{ConductorRecord, Node, Port, ProvisionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub reserved: Option<bool>,
    pub maintenance: Option<bool>,
    pub provision_state: Option<ProvisionState>,
    pub provisioned_before: Option<DateTime<Utc>>,
    pub associated: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// The persistence layer the conductor core consumes. The object-relational
/// mapping, schema, and transport to the actual database are out of scope;
/// only the operations the core calls are modeled here.
#[async_trait]
pub trait Store: Send + Sync {
    async fn register_conductor(
        &self,
        hostname: &str,
        drivers: BTreeSet<String>,
        update_existing: bool,
    ) -> ConductorResult<ConductorRecord>;

    async fn touch_conductor(&self, hostname: &str) -> ConductorResult<()>;

    async fn unregister_conductor(&self, hostname: &str) -> ConductorResult<()>;

    async fn clear_reservations_for(&self, hostname: &str) -> ConductorResult<u64>;

    async fn list_conductors(&self) -> ConductorResult<Vec<ConductorRecord>>;

    async fn get_nodeinfo_list(
        &self,
        filter: &NodeFilter,
        sort_key: Option<&str>,
        sort_dir: Option<SortDir>,
    ) -> ConductorResult<Vec<Node>>;

    async fn reserve_node(&self, hostname: &str, node_id: i64) -> ConductorResult<()>;

    async fn release_node(&self, hostname: &str, node_id: i64) -> ConductorResult<()>;

    async fn get_node(&self, node_id: i64) -> ConductorResult<Node>;

    async fn get_node_by_uuid(&self, uuid: &str) -> ConductorResult<Node>;

    async fn save_node(&self, node: &Node) -> ConductorResult<()>;

    async fn destroy_node(&self, node_id: i64) -> ConductorResult<()>;

    async fn get_port(&self, port_id: i64) -> ConductorResult<Port>;

    async fn save_port(&self, port: &Port) -> ConductorResult<()>;
}

/// In-memory [`Store`] used by the integration test harness and by unit
/// tests of the components layered on top of it. Not used in production;
/// a real deployment backs this trait with `sqlx`.
pub mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct State {
        nodes: HashMap<i64, Node>,
        nodes_by_uuid: HashMap<String, i64>,
        ports: HashMap<i64, Port>,
        conductors: HashMap<String, ConductorRecord>,
        next_node_id: i64,
        next_port_id: i64,
    }

    #[derive(Default)]
    pub struct InMemoryStore {
        state: Mutex<State>,
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_node(&self, mut node: Node) -> i64 {
            let mut state = self.state.lock();
            if node.id == 0 {
                state.next_node_id += 1;
                node.id = state.next_node_id;
            }
            state.nodes_by_uuid.insert(node.uuid.clone(), node.id);
            let id = node.id;
            state.nodes.insert(id, node);
            id
        }

        pub fn insert_port(&self, mut port: Port) -> i64 {
            let mut state = self.state.lock();
            if port.id == 0 {
                state.next_port_id += 1;
                port.id = state.next_port_id;
            }
            let id = port.id;
            state.ports.insert(id, port);
            id
        }
    }

    #[async_trait]
    impl Store for InMemoryStore {
        async fn register_conductor(
            &self,
            hostname: &str,
            drivers: BTreeSet<String>,
            update_existing: bool,
        ) -> ConductorResult<ConductorRecord> {
            let mut state = self.state.lock();
            if state.conductors.contains_key(hostname) && !update_existing {
                return Err(ConductorError::ConductorAlreadyRegistered(
                    hostname.to_string(),
                ));
            }
            let record = ConductorRecord {
                hostname: hostname.to_string(),
                drivers,
                updated_at: Utc::now(),
            };
            state
                .conductors
                .insert(hostname.to_string(), record.clone());
            Ok(record)
        }

        async fn touch_conductor(&self, hostname: &str) -> ConductorResult<()> {
            let mut state = self.state.lock();
            let record = state
                .conductors
                .get_mut(hostname)
                .ok_or_else(|| ConductorError::ConductorNotFound(hostname.to_string()))?;
            record.updated_at = Utc::now();
            Ok(())
        }

        async fn unregister_conductor(&self, hostname: &str) -> ConductorResult<()> {
            self.state.lock().conductors.remove(hostname);
            Ok(())
        }

        async fn clear_reservations_for(&self, hostname: &str) -> ConductorResult<u64> {
            let mut state = self.state.lock();
            let mut cleared = 0;
            for node in state.nodes.values_mut() {
                if node.reservation.as_deref() == Some(hostname) {
                    node.reservation = None;
                    cleared += 1;
                }
            }
            Ok(cleared)
        }

        async fn list_conductors(&self) -> ConductorResult<Vec<ConductorRecord>> {
            Ok(self.state.lock().conductors.values().cloned().collect())
        }

        async fn get_nodeinfo_list(
            &self,
            filter: &NodeFilter,
            sort_key: Option<&str>,
            sort_dir: Option<SortDir>,
        ) -> ConductorResult<Vec<Node>> {
            let state = self.state.lock();
            let mut nodes: Vec<Node> = state
                .nodes
                .values()
                .filter(|n| {
                    filter.reserved.map_or(true, |want| want == n.reservation.is_some())
                        && filter.maintenance.map_or(true, |want| want == n.maintenance)
                        && filter
                            .provision_state
                            .map_or(true, |want| want == n.provision_state)
                        && filter.associated.map_or(true, |want| want == n.is_associated())
                        && filter.provisioned_before.map_or(true, |cutoff| {
                            n.provision_updated_at.is_some_and(|t| t < cutoff)
                        })
                })
                .cloned()
                .collect();

            if sort_key == Some("provision_updated_at") {
                nodes.sort_by_key(|n| n.provision_updated_at);
                if sort_dir == Some(SortDir::Desc) {
                    nodes.reverse();
                }
            }

            Ok(nodes)
        }

        async fn reserve_node(&self, hostname: &str, node_id: i64) -> ConductorResult<()> {
            let mut state = self.state.lock();
            let node = state
                .nodes
                .get_mut(&node_id)
                .ok_or(ConductorError::NodeNotFound(node_id.to_string()))?;
            if node.reservation.is_some() {
                return Err(ConductorError::NodeLocked(node_id.to_string()));
            }
            node.reservation = Some(hostname.to_string());
            Ok(())
        }

        async fn release_node(&self, hostname: &str, node_id: i64) -> ConductorResult<()> {
            let mut state = self.state.lock();
            if let Some(node) = state.nodes.get_mut(&node_id) {
                if node.reservation.as_deref() == Some(hostname) {
                    node.reservation = None;
                }
            }
            Ok(())
        }

        async fn get_node(&self, node_id: i64) -> ConductorResult<Node> {
            self.state
                .lock()
                .nodes
                .get(&node_id)
                .cloned()
                .ok_or(ConductorError::NodeNotFound(node_id.to_string()))
        }

        async fn get_node_by_uuid(&self, uuid: &str) -> ConductorResult<Node> {
            let state = self.state.lock();
            let id = state
                .nodes_by_uuid
                .get(uuid)
                .copied()
                .ok_or_else(|| ConductorError::NodeNotFound(uuid.to_string()))?;
            state
                .nodes
                .get(&id)
                .cloned()
                .ok_or_else(|| ConductorError::NodeNotFound(uuid.to_string()))
        }

        async fn save_node(&self, node: &Node) -> ConductorResult<()> {
            let mut state = self.state.lock();
            state.nodes_by_uuid.insert(node.uuid.clone(), node.id);
            state.nodes.insert(node.id, node.clone());
            Ok(())
        }

        async fn destroy_node(&self, node_id: i64) -> ConductorResult<()> {
            let mut state = self.state.lock();
            let node = state
                .nodes
                .remove(&node_id)
                .ok_or(ConductorError::NodeNotFound(node_id.to_string()))?;
            state.nodes_by_uuid.remove(&node.uuid);
            Ok(())
        }

        async fn get_port(&self, port_id: i64) -> ConductorResult<Port> {
            self.state
                .lock()
                .ports
                .get(&port_id)
                .cloned()
                .ok_or_else(|| ConductorError::InvalidParameterValue(format!(
                    "no such port {port_id}"
                )))
        }

        async fn save_port(&self, port: &Port) -> ConductorResult<()> {
            self.state.lock().ports.insert(port.id, port.clone());
            Ok(())
        }
    }
}

use super::JsonMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: i64,
    pub node_id: i64,
    pub address: String,
    pub extra: JsonMap,
}

impl Port {
    pub fn vif_port_id(&self) -> Option<&str> {
        self.extra.get("vif_port_id").and_then(|v| v.as_str())
    }
}

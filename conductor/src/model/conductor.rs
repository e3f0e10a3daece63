use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct ConductorRecord {
    pub hostname: String,
    pub drivers: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConductorRecord {
    pub fn is_alive(&self, now: DateTime<Utc>, heartbeat_timeout: chrono::Duration) -> bool {
        now - self.updated_at <= heartbeat_timeout
    }

    pub fn supports(&self, driver: &str) -> bool {
        self.drivers.contains(driver)
    }
}

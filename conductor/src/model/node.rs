use super::JsonMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
    Reboot,
    Error,
    NoState,
}

impl PowerState {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Reboot => "reboot",
            PowerState::Error => "error",
            PowerState::NoState => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionState {
    Available,
    Deploying,
    DeployWait,
    DeployFail,
    Active,
    Deleting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub uuid: String,
    pub driver: String,
    pub power_state: PowerState,
    pub target_power_state: Option<PowerState>,
    pub provision_state: ProvisionState,
    pub target_provision_state: Option<ProvisionState>,
    pub maintenance: bool,
    pub maintenance_reason: String,
    pub reservation: Option<String>,
    /// Hostname of the conductor that last performed local-state-bearing
    /// work on this node (e.g. the last deploy or takeover).
    pub conductor_affinity: Option<String>,
    pub instance_uuid: Option<String>,
    pub instance_info: JsonMap,
    pub driver_info: JsonMap,
    pub extra: JsonMap,
    pub last_error: String,
    pub console_enabled: bool,
    pub provision_updated_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn is_mutable_by(&self, hostname: &str) -> bool {
        self.reservation.as_deref() == Some(hostname)
    }

    pub fn is_associated(&self) -> bool {
        self.instance_uuid.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn is_powered_down(&self) -> bool {
        matches!(self.power_state, PowerState::Off | PowerState::NoState)
    }
}

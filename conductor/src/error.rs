use crate::model::ProvisionState;

/// A conductor-level error kind. Handlers return exactly the kinds their doc
/// comment promises; the RPC layer forwards those to the client verbatim and
/// wraps anything else as an internal error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConductorError {
    #[error("no driver named '{0}' is loaded")]
    DriverNotFound(String),
    #[error("no drivers are loaded")]
    NoDriversLoaded,
    #[error("node {0} not found")]
    NodeNotFound(String),
    #[error("node {0} is locked by another conductor")]
    NodeLocked(String),
    #[error("node {0} is associated with an instance")]
    NodeAssociated(String),
    #[error("node {0} is in maintenance")]
    NodeInMaintenance(String),
    #[error("node {0} is in the wrong power state for this operation")]
    NodeInWrongPowerState(String),
    #[error("node {0} console is not enabled")]
    NodeConsoleNotEnabled(String),
    #[error("invalid parameter value: {0}")]
    InvalidParameterValue(String),
    #[error("missing parameter value: {0}")]
    MissingParameterValue(String),
    #[error("driver does not support this extension: {0}")]
    UnsupportedDriverExtension(String),
    #[error("no free conductor workers")]
    NoFreeConductorWorker,
    #[error("invalid state transition from {current:?} on event '{event}'")]
    InvalidState {
        current: ProvisionState,
        event: String,
    },
    #[error("instance deploy failed: {0}")]
    InstanceDeployFailure(String),
    #[error("failed to update MAC on port {0}")]
    FailedToUpdateMacOnPort(String),
    #[error("MAC address already exists: {0}")]
    MacAlreadyExists(String),
    #[error("failed to parse sensor data: {0}")]
    FailedToParseSensorData(String),
    #[error("failed to get sensor data: {0}")]
    FailedToGetSensorData(String),
    #[error("power state operation failed: {0}")]
    PowerStateFailure(String),
    #[error("database connection error: {0}")]
    DbConnectionError(String),
    #[error("conductor {0} is already registered")]
    ConductorAlreadyRegistered(String),
    #[error("conductor {0} not found")]
    ConductorNotFound(String),
}

impl ConductorError {
    /// Whether a periodic loop should log-and-skip this error for the
    /// current node and move on to the next one, rather than aborting the
    /// whole tick.
    pub fn is_skip_and_continue(&self) -> bool {
        matches!(self, Self::NodeNotFound(_) | Self::NodeLocked(_))
    }

    /// Whether a periodic loop should stop dispatching further work this
    /// tick and wait for the next one.
    pub fn is_worker_saturation(&self) -> bool {
        matches!(self, Self::NoFreeConductorWorker)
    }
}

pub type ConductorResult<T> = Result<T, ConductorError>;

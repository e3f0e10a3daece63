use crate::error::{ConductorError, ConductorResult};
use crate::model::ProvisionState;

/// Events the conductor core feeds into the provisioning FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionEvent {
    Deploy,
    Rebuild,
    Wait,
    Done,
    Fail,
    Error,
    Delete,
}

impl ProvisionEvent {
    fn as_str(&self) -> &'static str {
        match self {
            ProvisionEvent::Deploy => "deploy",
            ProvisionEvent::Rebuild => "rebuild",
            ProvisionEvent::Wait => "wait",
            ProvisionEvent::Done => "done",
            ProvisionEvent::Fail => "fail",
            ProvisionEvent::Error => "error",
            ProvisionEvent::Delete => "delete",
        }
    }
}

/// The async job a transition hands off to the worker pool. Kept as an enum
/// rather than a function pointer so the table stays data, testable without
/// a running core (§9 "State machine ownership").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    DoNodeDeploy,
    DoNodeTearDown,
    CleanupAfterTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next_state: ProvisionState,
    pub next_target: Option<ProvisionState>,
    pub callback: Option<Callback>,
}

/// Pure transition function over the illustrative table in the provisioning
/// FSM. Returns `InvalidState` for anything not listed. The `error` event
/// never changes `next_state` (callers keep the node in its current state
/// and only clear the target and set `last_error`).
pub fn transition(current: ProvisionState, event: ProvisionEvent) -> ConductorResult<Transition> {
    use ProvisionEvent::*;
    use ProvisionState::*;

    let result = match (current, event) {
        (Available, Deploy) => Transition {
            next_state: Deploying,
            next_target: Some(Active),
            callback: Some(Callback::DoNodeDeploy),
        },
        (Active, Rebuild) => Transition {
            next_state: Deploying,
            next_target: Some(Active),
            callback: Some(Callback::DoNodeDeploy),
        },
        (Deploying, Wait) => Transition {
            next_state: DeployWait,
            next_target: Some(Active),
            callback: None,
        },
        (DeployWait, Done) => Transition {
            next_state: Active,
            next_target: None,
            callback: None,
        },
        (Deploying, Done) => Transition {
            next_state: Active,
            next_target: None,
            callback: None,
        },
        (DeployWait, Fail) => Transition {
            next_state: DeployFail,
            next_target: None,
            callback: Some(Callback::CleanupAfterTimeout),
        },
        (Active, Delete) => Transition {
            next_state: Deleting,
            next_target: None,
            callback: Some(Callback::DoNodeTearDown),
        },
        (Deleting, Done) => Transition {
            next_state: Available,
            next_target: None,
            callback: None,
        },
        (state, Error) => Transition {
            next_state: state,
            next_target: None,
            callback: None,
        },
        _ => {
            return Err(ConductorError::InvalidState {
                current,
                event: event.as_str().to_string(),
            })
        }
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn happy_deploy_path() {
        let t = transition(ProvisionState::Available, ProvisionEvent::Deploy).unwrap();
        assert_eq!(t.next_state, ProvisionState::Deploying);
        assert_eq!(t.next_target, Some(ProvisionState::Active));
        assert_eq!(t.callback, Some(Callback::DoNodeDeploy));
    }

    #[test]
    fn deploy_wait_then_timeout() {
        let wait = transition(ProvisionState::Deploying, ProvisionEvent::Wait).unwrap();
        assert_eq!(wait.next_state, ProvisionState::DeployWait);
        assert_eq!(wait.callback, None);

        let fail = transition(ProvisionState::DeployWait, ProvisionEvent::Fail).unwrap();
        assert_eq!(fail.next_state, ProvisionState::DeployFail);
        assert_eq!(fail.callback, Some(Callback::CleanupAfterTimeout));
    }

    #[test]
    fn delete_tears_down_and_returns_to_available() {
        let deleting = transition(ProvisionState::Active, ProvisionEvent::Delete).unwrap();
        assert_eq!(deleting.next_state, ProvisionState::Deleting);
        assert_eq!(deleting.callback, Some(Callback::DoNodeTearDown));

        let available = transition(ProvisionState::Deleting, ProvisionEvent::Done).unwrap();
        assert_eq!(available.next_state, ProvisionState::Available);
    }

    #[test]
    fn error_event_keeps_state_clears_target() {
        let t = transition(ProvisionState::Deploying, ProvisionEvent::Error).unwrap();
        assert_eq!(t.next_state, ProvisionState::Deploying);
        assert_eq!(t.next_target, None);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let err = transition(ProvisionState::Available, ProvisionEvent::Wait).unwrap_err();
        assert!(matches!(err, ConductorError::InvalidState { .. }));
    }
}

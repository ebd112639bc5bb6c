//! Finite State Machine for deployment status

use crate::errors::DockyardError;
use crate::models::deployment::DeploymentStatus;

/// Deployment event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentEvent {
    /// Hand a pending record to the orchestrator
    BeginDeploy,

    /// Orchestrator brought the stack up
    DeploySucceeded,

    /// Orchestrator failed or timed out while deploying
    DeployFailed,

    /// Bring a stopped or failed stack back up
    Start,

    Stop,

    /// Restart in place; the status does not change
    Restart,

    /// A stop or restart invocation failed
    OperationFailed,

    /// Remove the record; the status does not change
    Delete,
}

impl DeploymentEvent {
    /// Verb used in transition errors
    pub fn verb(&self) -> &'static str {
        match self {
            DeploymentEvent::BeginDeploy => "deploy",
            DeploymentEvent::DeploySucceeded => "complete the deployment of",
            DeploymentEvent::DeployFailed => "fail the deployment of",
            DeploymentEvent::Start => "start",
            DeploymentEvent::Stop => "stop",
            DeploymentEvent::Restart => "restart",
            DeploymentEvent::OperationFailed => "mark as failed",
            DeploymentEvent::Delete => "delete",
        }
    }
}

/// Deployment FSM over a single record's status
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentStatus,
}

impl DeploymentFsm {
    /// Start from a stored status
    pub fn new(state: DeploymentStatus) -> Self {
        Self { state }
    }

    pub fn state(&self) -> DeploymentStatus {
        self.state
    }

    /// Process an event and transition state.
    ///
    /// An illegal event leaves the state untouched.
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentStatus, DockyardError> {
        use DeploymentEvent as E;
        use DeploymentStatus as S;

        let new_state = match (self.state, event) {
            (S::Pending, E::BeginDeploy) => S::Deploying,

            (S::Deploying, E::DeploySucceeded) => S::Running,
            (S::Deploying, E::DeployFailed) => S::Failed,

            (S::Stopped | S::Failed, E::Start) => S::Deploying,

            (S::Running | S::Deploying, E::Stop) => S::Stopped,

            (current @ (S::Running | S::Stopped), E::Restart) => current,

            (S::Running | S::Stopped | S::Deploying, E::OperationFailed) => S::Failed,

            (current @ (S::Stopped | S::Failed), E::Delete) => current,

            (current, event) => {
                return Err(DockyardError::InvalidTransition {
                    current,
                    requested: event.verb().to_string(),
                });
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

/// Status reached from `current` on `event`
pub fn next_status(
    current: DeploymentStatus,
    event: DeploymentEvent,
) -> Result<DeploymentStatus, DockyardError> {
    DeploymentFsm::new(current).process(event)
}

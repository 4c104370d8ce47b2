//! App lifecycle state machine

use crate::errors::OrchestratorError;
use crate::models::app::AppStatus;

/// App lifecycle event
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Pipeline started
    Deploy,

    /// New instance is running and routed
    DeploySucceeded,

    /// Pipeline aborted
    DeployFailed(String),

    /// Previous instance swapped back in
    RolledBack,

    /// Orchestrator restarted while a deploy was running
    Interrupted,
}

/// App lifecycle FSM
#[derive(Debug, Clone)]
pub struct AppFsm {
    state: AppStatus,
    error: Option<String>,
}

impl AppFsm {
    /// Resume from a persisted status
    pub fn new(state: AppStatus) -> Self {
        Self { state, error: None }
    }

    pub fn state(&self) -> AppStatus {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: AppEvent) -> Result<AppStatus, OrchestratorError> {
        let new_state = match (&self.state, &event) {
            // A running deploy excludes every other transition except its outcome
            (AppStatus::Deploying, AppEvent::DeploySucceeded) => {
                self.error = None;
                AppStatus::Active
            }
            (AppStatus::Deploying, AppEvent::DeployFailed(err)) => {
                self.error = Some(err.clone());
                AppStatus::Error
            }
            (AppStatus::Deploying, AppEvent::Interrupted) => {
                self.error = Some("deploy interrupted by orchestrator restart".to_string());
                AppStatus::Error
            }

            (AppStatus::Inactive | AppStatus::Active | AppStatus::Error, AppEvent::Deploy) => {
                self.error = None;
                AppStatus::Deploying
            }

            (AppStatus::Active | AppStatus::Error, AppEvent::RolledBack) => {
                self.error = None;
                AppStatus::Active
            }

            // Invalid transitions
            (state, event) => {
                return Err(OrchestratorError::InvalidTransition(format!(
                    "app cannot go from {:?} on {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_cycle() {
        let mut fsm = AppFsm::new(AppStatus::Inactive);
        assert_eq!(fsm.process(AppEvent::Deploy).unwrap(), AppStatus::Deploying);
        assert_eq!(fsm.process(AppEvent::DeploySucceeded).unwrap(), AppStatus::Active);
        assert_eq!(fsm.process(AppEvent::Deploy).unwrap(), AppStatus::Deploying);
        fsm.process(AppEvent::DeployFailed("build failed".into())).unwrap();
        assert_eq!(fsm.state(), AppStatus::Error);
        assert_eq!(fsm.error(), Some("build failed"));
    }

    #[test]
    fn test_deploy_rejected_while_deploying() {
        let mut fsm = AppFsm::new(AppStatus::Deploying);
        assert!(matches!(
            fsm.process(AppEvent::Deploy),
            Err(OrchestratorError::InvalidTransition(_))
        ));
        assert!(fsm.process(AppEvent::RolledBack).is_err());
        assert_eq!(fsm.state(), AppStatus::Deploying);
    }

    #[test]
    fn test_rollback_from_error() {
        let mut fsm = AppFsm::new(AppStatus::Error);
        assert_eq!(fsm.process(AppEvent::RolledBack).unwrap(), AppStatus::Active);
        assert!(AppFsm::new(AppStatus::Inactive)
            .process(AppEvent::RolledBack)
            .is_err());
    }

    #[test]
    fn test_interrupted_deploy_becomes_error() {
        let mut fsm = AppFsm::new(AppStatus::Deploying);
        assert_eq!(fsm.process(AppEvent::Interrupted).unwrap(), AppStatus::Error);
        assert!(AppFsm::new(AppStatus::Active)
            .process(AppEvent::Interrupted)
            .is_err());
    }
}

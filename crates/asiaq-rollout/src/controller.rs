//! Deployment controller: the per-attempt state machine.
//!
//! Blue/green:
//!
//! ```text
//! Pending → NewStackCreated → SmokeWait → IntegrationRunning → IntegrationPassed
//!         → ExitTestMode → AttachToProduction → WaitHealthy → OldStackDestroyed
//! ```
//!
//! Any failure before a terminal phase moves to `Rollback`, and from there
//! to `RolledBack` once the new stack is gone. Non-deployable hostclasses
//! stop after `IntegrationPassed` with `Validated`.
//!
//! Classic: `Pending → ImageUpdated → SmokeWait → Completed`, passing
//! through `IntegrationRunning → IntegrationPassed` after `SmokeWait` when
//! the hostclass has an integration test. A failure is terminal as
//! `MixedFleet`, there is no way back.
//!
//! The controller performs no I/O. The orchestrator drives it and persists
//! the attempt after every transition.

use tracing::{debug, info, warn};

use asiaq_core::{DeploymentStrategy, epoch_secs};
use asiaq_state::{DeploymentAttempt, DeploymentPhase, PhaseTransition, TestOutcome};

use crate::error::{RolloutError, RolloutResult};

/// A deployment attempt in progress.
#[derive(Debug, Clone)]
pub struct Deployment {
    attempt: DeploymentAttempt,
}

impl Deployment {
    pub fn new(
        id: &str,
        environment: &str,
        hostclass: &str,
        strategy: DeploymentStrategy,
        image_id: &str,
        stable_group: Option<String>,
    ) -> Self {
        let now = epoch_secs();
        Self {
            attempt: DeploymentAttempt {
                id: id.to_string(),
                environment: environment.to_string(),
                hostclass: hostclass.to_string(),
                strategy,
                image_id: image_id.to_string(),
                stable_group,
                new_group: None,
                phase: DeploymentPhase::Pending,
                smoke: None,
                integration: None,
                error: None,
                history: vec![PhaseTransition {
                    phase: DeploymentPhase::Pending,
                    at: now,
                }],
                started_at: now,
                updated_at: now,
            },
        }
    }

    /// Resume from a persisted attempt.
    pub fn from_attempt(attempt: DeploymentAttempt) -> Self {
        Self { attempt }
    }

    pub fn attempt(&self) -> &DeploymentAttempt {
        &self.attempt
    }

    pub fn into_attempt(self) -> DeploymentAttempt {
        self.attempt
    }

    pub fn phase(&self) -> DeploymentPhase {
        self.attempt.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.attempt.phase.is_terminal()
    }

    pub fn set_new_group(&mut self, group: &str) {
        self.attempt.new_group = Some(group.to_string());
    }

    pub fn record_smoke(&mut self, outcome: TestOutcome) {
        self.attempt.smoke = Some(outcome);
    }

    pub fn record_integration(&mut self, outcome: TestOutcome) {
        self.attempt.integration = Some(outcome);
    }

    /// Move to the next phase of the happy path.
    pub fn advance(&mut self) -> RolloutResult<DeploymentPhase> {
        let next = next_phase(self.attempt.strategy, self.attempt.phase)
            .ok_or_else(|| self.invalid("next step"))?;
        self.transition(next);
        Ok(next)
    }

    /// Enter `IntegrationRunning` from `SmokeWait`, under either strategy.
    pub fn start_integration(&mut self) -> RolloutResult<DeploymentPhase> {
        if self.attempt.phase != DeploymentPhase::SmokeWait {
            return Err(self.invalid(&DeploymentPhase::IntegrationRunning.to_string()));
        }
        self.transition(DeploymentPhase::IntegrationRunning);
        Ok(DeploymentPhase::IntegrationRunning)
    }

    /// No integration test configured: go from `SmokeWait` straight to
    /// `IntegrationPassed`.
    pub fn skip_integration(&mut self) -> RolloutResult<DeploymentPhase> {
        if self.attempt.strategy != DeploymentStrategy::BlueGreen
            || self.attempt.phase != DeploymentPhase::SmokeWait
        {
            return Err(self.invalid(&DeploymentPhase::IntegrationPassed.to_string()));
        }
        self.attempt.integration = Some(TestOutcome::Skipped);
        self.transition(DeploymentPhase::IntegrationPassed);
        Ok(DeploymentPhase::IntegrationPassed)
    }

    /// Finish a validation-only attempt after its tests passed.
    pub fn validate(&mut self) -> RolloutResult<DeploymentPhase> {
        if self.attempt.phase != DeploymentPhase::IntegrationPassed {
            return Err(self.invalid(&DeploymentPhase::Validated.to_string()));
        }
        self.transition(DeploymentPhase::Validated);
        Ok(DeploymentPhase::Validated)
    }

    /// Record a failure. Blue/green enters `Rollback`; classic ends as
    /// `MixedFleet`.
    pub fn fail(&mut self, reason: &str) -> RolloutResult<DeploymentPhase> {
        if self.is_terminal() || self.attempt.phase == DeploymentPhase::Rollback {
            return Err(self.invalid("failure handling"));
        }
        warn!(
            attempt = %self.attempt.id,
            hostclass = %self.attempt.hostclass,
            phase = %self.attempt.phase,
            %reason,
            "deployment failed"
        );
        self.attempt.error = Some(reason.to_string());
        let next = match self.attempt.strategy {
            DeploymentStrategy::BlueGreen => DeploymentPhase::Rollback,
            DeploymentStrategy::Classic => DeploymentPhase::MixedFleet,
        };
        self.transition(next);
        Ok(next)
    }

    /// The new stack has been removed.
    pub fn finish_rollback(&mut self) -> RolloutResult<DeploymentPhase> {
        if self.attempt.phase != DeploymentPhase::Rollback {
            return Err(self.invalid(&DeploymentPhase::RolledBack.to_string()));
        }
        self.transition(DeploymentPhase::RolledBack);
        Ok(DeploymentPhase::RolledBack)
    }

    fn transition(&mut self, next: DeploymentPhase) {
        let now = epoch_secs();
        debug!(attempt = %self.attempt.id, from = %self.attempt.phase, to = %next, "phase transition");
        self.attempt.phase = next;
        self.attempt.updated_at = now;
        self.attempt.history.push(PhaseTransition { phase: next, at: now });
        if next.is_terminal() {
            info!(
                attempt = %self.attempt.id,
                hostclass = %self.attempt.hostclass,
                phase = %next,
                "deployment finished"
            );
        }
    }

    fn invalid(&self, to: &str) -> RolloutError {
        RolloutError::InvalidTransition {
            attempt: self.attempt.id.clone(),
            from: self.attempt.phase,
            to: to.to_string(),
        }
    }
}

/// Happy-path successor of `phase` under `strategy`.
fn next_phase(strategy: DeploymentStrategy, phase: DeploymentPhase) -> Option<DeploymentPhase> {
    use DeploymentPhase::*;
    match strategy {
        DeploymentStrategy::BlueGreen => match phase {
            Pending => Some(NewStackCreated),
            NewStackCreated => Some(SmokeWait),
            SmokeWait => Some(IntegrationRunning),
            IntegrationRunning => Some(IntegrationPassed),
            IntegrationPassed => Some(ExitTestMode),
            ExitTestMode => Some(AttachToProduction),
            AttachToProduction => Some(WaitHealthy),
            WaitHealthy => Some(OldStackDestroyed),
            _ => None,
        },
        DeploymentStrategy::Classic => match phase {
            Pending => Some(ImageUpdated),
            ImageUpdated => Some(SmokeWait),
            SmokeWait => Some(Completed),
            IntegrationRunning => Some(IntegrationPassed),
            IntegrationPassed => Some(Completed),
            _ => None,
        },
    }
}

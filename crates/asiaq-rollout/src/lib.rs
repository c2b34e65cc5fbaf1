//! asiaq-rollout: image deployments.
//!
//! Two strategies:
//!
//! - **Blue/green**: launch the new image in an isolated group, smoke and
//!   integration test it, attach it to production, wait for health, then
//!   destroy the old group. Any failure destroys only the new group.
//! - **Classic**: swap the image on the running group and smoke test it.
//!   A failure leaves a mixed fleet and is reported as such.
//!
//! Hostclasses that are not deployable are validated on an isolated group
//! and never replace production instances.
//!
//! # Architecture
//!
//! ```text
//! DeploymentOrchestrator
//!   ├── ProvisioningScheduler (planning, launch, smoke gate)
//!   ├── RemoteExec (integration tests over ssh or locally)
//!   ├── Deployment (per-attempt state machine, persisted each step)
//!   └── selection (which image to test or roll out next)
//! ```

pub mod controller;
pub mod error;
pub mod orchestrator;
pub mod remote;
pub mod selection;

pub use controller::Deployment;
pub use error::{RolloutError, RolloutResult};
pub use orchestrator::{DeployFilter, DeployOutcome, DeploymentOrchestrator, IntegrationPlan};
pub use remote::{ExecError, LocalExec, RemoteExec, SshExec};
pub use selection::{pick, test_candidates, update_candidates};

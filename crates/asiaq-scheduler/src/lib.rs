//! asiaq-scheduler: environment lifecycle and pipeline provisioning.
//!
//! The scheduler turns a pipeline (hostclasses with sequence numbers and
//! size overrides) into running autoscaling groups:
//!
//! - Sequence groups start strictly in ascending order
//! - Entries inside a group launch concurrently, bounded by `max_parallel`
//! - Each group waits for its instances to pass smoke tests before the next
//!   group starts
//! - A failed run tears down the groups it created
//!
//! # Architecture
//!
//! ```text
//! ProvisioningScheduler
//!   ├── AsiaqConfig (hostclass settings, run-wide defaults)
//!   ├── StateStore (environments, image catalog)
//!   ├── Cloud (groups, instances, load balancers)
//!   └── SmokeGate
//!       └── SmokeProbe (one polling task per instance)
//!
//! EnvironmentManager
//!   ├── EnvironmentRegistry (atomic allocate + register)
//!   └── Cloud (group teardown on destroy)
//! ```

pub mod cloud;
pub mod environment;
pub mod error;
pub mod local;
pub mod probe;
pub mod scheduler;
pub mod smoke;

pub use cloud::{Cloud, CloudError, CloudResult, SmokeProbe, SmokeStatus};
pub use environment::EnvironmentManager;
pub use error::{SchedulerError, SchedulerResult};
pub use local::{LocalCloud, StatusProbe};
pub use probe::{SshProbe, ssh_command};
pub use scheduler::{
    LaunchPlan, LaunchReport, ProvisionReport, ProvisioningScheduler, RunOptions, launch,
    production_group, resolve_sizes, snap_to_range,
};
pub use smoke::SmokeGate;

//! asiaq-chaos: controlled instance termination.
//!
//! A chaos pass kills a percentage of the running instances in an
//! environment while every fleet keeps at least its retainage:
//!
//! - Groups of hostclasses with `chaos = no` are never touched
//! - Isolated test groups of an in-flight deployment are skipped
//! - Each fleet keeps `ceil(retainage% × running)` instances
//! - The kill count is `ceil(level% × running)` over all eligible
//!   fleets, capped by what retainage leaves available
//!
//! # Architecture
//!
//! ```text
//! run(cloud, environment, selector, rng, dry_run)
//!   ├── fleets()    running instances per eligible group
//!   ├── ChaosSelector::select  (pure, RandomSource-driven)
//!   └── Cloud::terminate_instances  (skipped on dry run)
//! ```

pub mod error;
pub mod selector;

pub use error::{ChaosError, ChaosResult};
pub use selector::{ChaosReport, ChaosSelector, Fleet, Victim, fleets, run};

//! asiaq-autoscale: time-varying group capacity.
//!
//! A group size is either a constant or a list of `count@cron` entries. The
//! planner answers "what should the size be right now" by finding the entry
//! whose trigger fired most recently.
//!
//! # Resolution
//!
//! ```text
//! "1@30 10 * * *:5@45 1 * * *"
//!
//! now = 02:00  → last firings: 10:30 yesterday, 01:45 today → 5
//! now = 11:00  → last firings: 10:30 today,     01:45 today → 1
//! ```
//!
//! Ties go to the later-listed entry. If nothing fired within the lookback
//! window the first entry's count is used.

pub mod cron;
pub mod error;
pub mod planner;
pub mod schedule;

pub use cron::CronExpr;
pub use error::{ScheduleError, ScheduleResult};
pub use planner::{CapacityPlanner, ScheduledAction, scheduled_actions};
pub use schedule::{CapacityEntry, CapacitySchedule};

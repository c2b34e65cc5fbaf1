//! Capacity planner: resolve a schedule to a count at a given instant.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::schedule::CapacitySchedule;

/// Resolves capacity schedules against the clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityPlanner;

impl CapacityPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Count of the entry whose trigger fired most recently at or before `now`.
    ///
    /// Ties go to the later-listed entry. With no firing in the lookback
    /// window, the first entry's count.
    pub fn resolve(&self, schedule: &CapacitySchedule, now: DateTime<Utc>) -> u32 {
        let mut best: Option<(DateTime<Utc>, u32)> = None;
        for entry in schedule.entries() {
            let fired = match &entry.trigger {
                None => return entry.count,
                Some(cron) => cron.last_fire_at_or_before(now),
            };
            if let Some(fired) = fired {
                if best.is_none_or(|(at, _)| fired >= at) {
                    best = Some((fired, entry.count));
                }
            }
        }

        let count = best.map(|(_, count)| count).unwrap_or_else(|| schedule.first_count());
        debug!(%schedule, %now, count, "capacity resolved");
        count
    }

    /// Resolve against the current time.
    pub fn resolve_now(&self, schedule: &CapacitySchedule) -> u32 {
        self.resolve(schedule, Utc::now())
    }
}

/// A recurring size change registered on an autoscaling group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub recurrence: String,
    pub min_size: Option<u32>,
    pub desired_size: Option<u32>,
    pub max_size: Option<u32>,
}

/// Merge the triggered entries of the three size schedules by recurrence.
///
/// Constant schedules contribute nothing.
pub fn scheduled_actions(
    min: Option<&CapacitySchedule>,
    desired: Option<&CapacitySchedule>,
    max: Option<&CapacitySchedule>,
) -> Vec<ScheduledAction> {
    let mut by_recurrence: BTreeMap<String, ScheduledAction> = BTreeMap::new();
    let mut apply = |schedule: Option<&CapacitySchedule>, set: fn(&mut ScheduledAction, u32)| {
        for entry in schedule.map(|s| s.entries()).unwrap_or_default() {
            if let Some(cron) = &entry.trigger {
                let action = by_recurrence
                    .entry(cron.as_str().to_string())
                    .or_insert_with(|| ScheduledAction {
                        recurrence: cron.as_str().to_string(),
                        min_size: None,
                        desired_size: None,
                        max_size: None,
                    });
                set(action, entry.count);
            }
        }
    };
    apply(min, |a, n| a.min_size = Some(n));
    apply(desired, |a, n| a.desired_size = Some(n));
    apply(max, |a, n| a.max_size = Some(n));
    by_recurrence.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 14, h, m, 0).unwrap()
    }

    #[test]
    fn constant_resolves_to_itself() {
        let planner = CapacityPlanner::new();
        assert_eq!(planner.resolve(&CapacitySchedule::constant(7), at(3, 0)), 7);
    }

    #[test]
    fn two_trigger_schedule_follows_clock() {
        let planner = CapacityPlanner::new();
        let s = CapacitySchedule::parse("1@30 10 * * *:5@45 1 * * *").unwrap();

        assert_eq!(planner.resolve(&s, at(2, 0)), 5);
        assert_eq!(planner.resolve(&s, at(11, 0)), 1);
        assert_eq!(planner.resolve(&s, at(10, 29)), 5);
        assert_eq!(planner.resolve(&s, at(10, 30)), 1);
        assert_eq!(planner.resolve(&s, at(1, 44)), 1);
    }

    #[test]
    fn simultaneous_triggers_prefer_later_entry() {
        let planner = CapacityPlanner::new();
        let s = CapacitySchedule::parse("2@0 9 * * *:8@0 9 * * *").unwrap();
        assert_eq!(planner.resolve(&s, at(12, 0)), 8);
    }

    #[test]
    fn never_fired_uses_first_entry() {
        let planner = CapacityPlanner::new();
        let s = CapacitySchedule::parse("4@0 0 31 2 *:9@0 0 30 2 *").unwrap();
        assert_eq!(planner.resolve(&s, at(12, 0)), 4);
    }

    #[test]
    fn actions_merge_by_recurrence() {
        let min = CapacitySchedule::parse("1@0 22 * * *:4@0 10 * * *").unwrap();
        let desired = CapacitySchedule::parse("2@0 22 * * *:8@0 10 * * *").unwrap();
        let max = CapacitySchedule::constant(10);

        let actions = scheduled_actions(Some(&min), Some(&desired), Some(&max));
        assert_eq!(
            actions,
            vec![
                ScheduledAction {
                    recurrence: "0 10 * * *".to_string(),
                    min_size: Some(4),
                    desired_size: Some(8),
                    max_size: None,
                },
                ScheduledAction {
                    recurrence: "0 22 * * *".to_string(),
                    min_size: Some(1),
                    desired_size: Some(2),
                    max_size: None,
                },
            ]
        );
        assert!(scheduled_actions(None, Some(&max), None).is_empty());
    }
}

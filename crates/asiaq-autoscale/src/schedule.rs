//! Capacity expressions: `3` or `2@0 22 * * *:24@0 10 * * *`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cron::CronExpr;
use crate::error::{ScheduleError, ScheduleResult};

/// One `count@trigger` segment. A constant has no trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityEntry {
    pub count: u32,
    pub trigger: Option<CronExpr>,
}

/// Ordered capacity entries; a constant is the single-entry case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapacitySchedule {
    entries: Vec<CapacityEntry>,
}

impl CapacitySchedule {
    pub fn constant(count: u32) -> Self {
        Self {
            entries: vec![CapacityEntry {
                count,
                trigger: None,
            }],
        }
    }

    pub fn parse(spec: &str) -> ScheduleResult<Self> {
        let spec = spec.trim();
        if let Ok(count) = spec.parse::<u32>() {
            return Ok(Self::constant(count));
        }

        let mut entries = Vec::new();
        for segment in spec.split(':') {
            let (count, cron) = segment
                .split_once('@')
                .ok_or_else(|| ScheduleError::InvalidCapacity(spec.to_string()))?;
            let count = count
                .trim()
                .parse::<u32>()
                .map_err(|_| ScheduleError::InvalidCapacity(spec.to_string()))?;
            entries.push(CapacityEntry {
                count,
                trigger: Some(CronExpr::parse(cron)?),
            });
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[CapacityEntry] {
        &self.entries
    }

    pub fn is_constant(&self) -> bool {
        self.entries.iter().all(|e| e.trigger.is_none())
    }

    /// Smallest count across all entries.
    pub fn min_count(&self) -> u32 {
        self.entries.iter().map(|e| e.count).min().unwrap_or(0)
    }

    /// Largest count across all entries.
    pub fn max_count(&self) -> u32 {
        self.entries.iter().map(|e| e.count).max().unwrap_or(0)
    }

    /// Count of the first entry, used when nothing has fired yet.
    pub fn first_count(&self) -> u32 {
        self.entries.first().map(|e| e.count).unwrap_or(0)
    }
}

impl fmt::Display for CapacitySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|e| match &e.trigger {
                Some(cron) => format!("{}@{}", e.count, cron),
                None => e.count.to_string(),
            })
            .collect();
        f.write_str(&parts.join(":"))
    }
}

impl FromStr for CapacitySchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapacitySchedule::parse(s)
    }
}

impl TryFrom<String> for CapacitySchedule {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CapacitySchedule::parse(&value)
    }
}

impl From<CapacitySchedule> for String {
    fn from(value: CapacitySchedule) -> Self {
        value.to_string()
    }
}

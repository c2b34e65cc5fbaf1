//! Pipeline CSV: which hostclasses to start, in what order, at what size.
//!
//! ```text
//! sequence,hostclass,min_size,desired_size,max_size,smoke_test,deployable
//! 1,mhcbastion,1,1,1,no,
//! 2,mhcdb,2,2,2,yes,no
//! 3,mhcweb,2,"2@0 22 * * *:6@0 8 * * 1,2,3,4,5",8,yes,yes
//! ```
//!
//! Cells may be double-quoted to carry commas. Empty cells mean unset.

use std::collections::BTreeMap;
use std::path::Path;

use asiaq_autoscale::CapacitySchedule;
use asiaq_core::is_truthy;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

pub const COLUMNS: &[&str] = &[
    "sequence",
    "hostclass",
    "min_size",
    "desired_size",
    "max_size",
    "instance_type",
    "extra_disk",
    "iops",
    "smoke_test",
    "ami",
    "deployable",
    "integration_test",
];

/// One pipeline row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineEntry {
    pub sequence: u32,
    pub hostclass: String,
    pub min_size: Option<CapacitySchedule>,
    pub desired_size: Option<CapacitySchedule>,
    pub max_size: Option<CapacitySchedule>,
    pub instance_type: Option<String>,
    pub extra_disk: Option<u32>,
    pub iops: Option<u32>,
    /// `None` defers to the hostclass configuration.
    pub smoke_test: Option<bool>,
    /// Pinned image id.
    pub ami: Option<String>,
    pub deployable: Option<bool>,
    pub integration_test: Option<String>,
}

impl PipelineEntry {
    /// An entry with only a hostclass set.
    pub fn new(hostclass: &str) -> Self {
        Self {
            sequence: 1,
            hostclass: hostclass.to_string(),
            min_size: None,
            desired_size: None,
            max_size: None,
            instance_type: None,
            extra_disk: None,
            iops: None,
            smoke_test: None,
            ami: None,
            deployable: None,
            integration_test: None,
        }
    }
}

/// Parsed pipeline, in file order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineSpec {
    entries: Vec<PipelineEntry>,
}

impl PipelineSpec {
    pub fn new(entries: Vec<PipelineEntry>) -> Self {
        Self { entries }
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let spec = Self::parse(&content)?;
        debug!(?path, entries = spec.entries.len(), "pipeline loaded");
        Ok(spec)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        let mut lines = content
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let (header_line, header) = lines.next().ok_or(ConfigError::Pipeline {
            line: 0,
            reason: "missing header row".to_string(),
        })?;
        let header: Vec<String> = split_row(header_line, header)?
            .into_iter()
            .map(|c| c.to_ascii_lowercase())
            .collect();
        for column in &header {
            if !COLUMNS.contains(&column.as_str()) {
                return Err(ConfigError::Pipeline {
                    line: header_line,
                    reason: format!("unknown column '{column}'"),
                });
            }
        }
        if !header.iter().any(|c| c == "hostclass") {
            return Err(ConfigError::Pipeline {
                line: header_line,
                reason: "missing 'hostclass' column".to_string(),
            });
        }

        let mut entries = Vec::new();
        for (line_no, line) in lines {
            let cells = split_row(line_no, line)?;
            if cells.len() > header.len() {
                return Err(ConfigError::Pipeline {
                    line: line_no,
                    reason: format!("{} cells for {} columns", cells.len(), header.len()),
                });
            }
            let row: BTreeMap<&str, &str> = header
                .iter()
                .map(String::as_str)
                .zip(cells.iter().map(|c| c.as_str()))
                .filter(|(_, v)| !v.is_empty())
                .collect();
            entries.push(parse_entry(line_no, &row)?);
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.hostclass.as_str()) {
                return Err(ConfigError::Pipeline {
                    line: 0,
                    reason: format!("hostclass {} listed twice", entry.hostclass),
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[PipelineEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, hostclass: &str) -> Option<&PipelineEntry> {
        self.entries.iter().find(|e| e.hostclass == hostclass)
    }

    pub fn hostclasses(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.hostclass.as_str()).collect()
    }

    /// Entries grouped by ascending sequence number, file order within a group.
    pub fn groups(&self) -> Vec<(u32, Vec<&PipelineEntry>)> {
        let mut groups: BTreeMap<u32, Vec<&PipelineEntry>> = BTreeMap::new();
        for entry in &self.entries {
            groups.entry(entry.sequence).or_default().push(entry);
        }
        groups.into_iter().collect()
    }

    /// Keep only the named hostclasses.
    pub fn restricted_to(&self, hostclasses: &[String]) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|e| hostclasses.iter().any(|h| *h == e.hostclass))
                .cloned()
                .collect(),
        }
    }
}

fn parse_entry(line: usize, row: &BTreeMap<&str, &str>) -> ConfigResult<PipelineEntry> {
    let err = |reason: String| ConfigError::Pipeline { line, reason };
    let number = |column: &str| -> ConfigResult<Option<u32>> {
        row.get(column)
            .map(|v| v.parse::<u32>().map_err(|_| err(format!("{column} '{v}' is not a number"))))
            .transpose()
    };
    let schedule = |column: &str| -> ConfigResult<Option<CapacitySchedule>> {
        row.get(column)
            .map(|v| CapacitySchedule::parse(v).map_err(|e| err(format!("{column}: {e}"))))
            .transpose()
    };
    let text = |column: &str| row.get(column).map(|v| v.to_string());
    let flag = |column: &str| row.get(column).map(|v| is_truthy(v));

    let hostclass = text("hostclass").ok_or_else(|| err("empty hostclass".to_string()))?;
    let entry = PipelineEntry {
        sequence: number("sequence")?.unwrap_or(1),
        hostclass,
        min_size: schedule("min_size")?,
        desired_size: schedule("desired_size")?,
        max_size: schedule("max_size")?,
        instance_type: text("instance_type"),
        extra_disk: number("extra_disk")?,
        iops: number("iops")?,
        smoke_test: flag("smoke_test"),
        ami: text("ami"),
        deployable: flag("deployable"),
        integration_test: text("integration_test"),
    };

    if let (Some(min), Some(max)) = (&entry.min_size, &entry.max_size) {
        if min.max_count() > max.max_count() || min.min_count() > max.min_count() {
            return Err(err(format!("min_size {min} exceeds max_size {max}")));
        }
    }
    if let Some(desired) = entry.desired_size.as_ref().filter(|d| d.is_constant()) {
        let count = desired.first_count();
        if entry.min_size.as_ref().is_some_and(|m| m.is_constant() && m.first_count() > count)
            || entry.max_size.as_ref().is_some_and(|m| m.is_constant() && m.first_count() < count)
        {
            return Err(err(format!("desired_size {count} outside min_size/max_size")));
        }
    }
    Ok(entry)
}

/// Split a CSV row, honouring double quotes and `""` escapes.
fn split_row(line_no: usize, line: &str) -> ConfigResult<Vec<String>> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut cell).trim().to_string()),
            c => cell.push(c),
        }
    }
    if quoted {
        return Err(ConfigError::Pipeline {
            line: line_no,
            reason: "unterminated quote".to_string(),
        });
    }
    cells.push(cell.trim().to_string());
    Ok(cells)
}

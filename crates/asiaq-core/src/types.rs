//! Shared types used across Asiaq crates.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// The fixed set of network segments inside an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetanetworkName {
    /// Inter-host traffic.
    Intranet,
    /// Outbound internet proxy.
    Tunnel,
    /// Client facing.
    Dmz,
    /// Admin jump boxes.
    Maintenance,
}

impl MetanetworkName {
    /// All metanetworks in their canonical order.
    pub const ALL: [MetanetworkName; 4] = [
        MetanetworkName::Intranet,
        MetanetworkName::Tunnel,
        MetanetworkName::Dmz,
        MetanetworkName::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetanetworkName::Intranet => "intranet",
            MetanetworkName::Tunnel => "tunnel",
            MetanetworkName::Dmz => "dmz",
            MetanetworkName::Maintenance => "maintenance",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            MetanetworkName::Intranet => "Inter host",
            MetanetworkName::Tunnel => "Internet http proxy",
            MetanetworkName::Dmz => "Client facing",
            MetanetworkName::Maintenance => "Admin jump box",
        }
    }
}

impl fmt::Display for MetanetworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetanetworkName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetanetworkName::ALL
            .into_iter()
            .find(|name| name.as_str() == s.trim())
            .ok_or_else(|| format!("unknown metanetwork '{s}'"))
    }
}

/// How new images reach a hostclass's production fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    /// Replace the image of the existing group in place.
    Classic,
    /// Stand up a parallel group, test it, then cut over.
    #[default]
    BlueGreen,
}

impl fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStrategy::Classic => f.write_str("classic"),
            DeploymentStrategy::BlueGreen => f.write_str("blue_green"),
        }
    }
}

impl FromStr for DeploymentStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "classic" => Ok(DeploymentStrategy::Classic),
            "blue_green" | "bluegreen" => Ok(DeploymentStrategy::BlueGreen),
            other => Err(format!("unknown deployment strategy '{other}'")),
        }
    }
}

/// Promotion stage of a baked image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStage {
    Untested,
    Tested,
    Failed,
}

impl fmt::Display for ImageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageStage::Untested => f.write_str("untested"),
            ImageStage::Tested => f.write_str("tested"),
            ImageStage::Failed => f.write_str("failed"),
        }
    }
}

impl FromStr for ImageStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "untested" => Ok(ImageStage::Untested),
            "tested" => Ok(ImageStage::Tested),
            "failed" => Ok(ImageStage::Failed),
            other => Err(format!("unknown image stage '{other}'")),
        }
    }
}

/// Interpret a configuration flag. Anything outside the yes-list is false.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "t" | "y" | "aye" | "1"
    )
}

/// Current time as Unix seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

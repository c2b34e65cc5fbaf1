//! redb table definitions for the Asiaq state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{environment}/{name}` or `{parent}:{child}`.

use redb::TableDefinition;

/// Environments keyed by `{name}`.
pub const ENVIRONMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");

/// Autoscaling groups keyed by `{environment}/{group}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Instances keyed by `{environment}/{group}:{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Deployment attempts keyed by `{attempt_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Volume snapshots keyed by `{hostclass}:{snapshot_id}`.
pub const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

/// Image catalog keyed by `{image_id}`.
pub const IMAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("images");

/// Shape shared by every table above.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

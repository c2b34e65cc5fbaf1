//! asiaq-state: embedded state store for Asiaq.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for environments, autoscaling groups, instances, deployment
//! attempts, snapshots and the image catalog.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{environment}/{group}`, `{environment}/{group}:{instance}`)
//! enable prefix scans for related records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. The [`EnvironmentRegistry`] layers
//! the range bookkeeping on top: its read-compute-register sequence runs in
//! a single write transaction, so two processes sharing a database cannot
//! hand out overlapping ranges.

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use registry::EnvironmentRegistry;
pub use store::StateStore;
pub use types::*;

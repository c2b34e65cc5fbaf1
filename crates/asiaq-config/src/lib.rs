//! asiaq-config: typed configuration.
//!
//! Two inputs drive every command:
//!
//! - `asiaq.toml`, with `[asiaq]` defaults, `[envtype.<type>]` and
//!   `[env.<name>]` network sections, `[hostclass.<name>]` sections and a
//!   `[test]` section. Any key may carry an `@<environment>` suffix that wins
//!   for that environment.
//! - A pipeline CSV listing hostclasses, their start-up sequence and size
//!   overrides.
//!
//! Both are validated completely at load time; a bad key or value is a
//! [`ConfigError`] before anything touches the cloud.

pub mod config;
pub mod error;
pub mod hostclass;
pub mod network;
pub mod pipeline;

pub use config::{AsiaqConfig, Settings};
pub use error::{ConfigError, ConfigResult};
pub use hostclass::{HostclassConfig, IntegrationTestSettings};
pub use network::NetworkSettings;
pub use pipeline::{PipelineEntry, PipelineSpec};

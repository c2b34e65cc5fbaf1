//! Per-hostclass settings.
//!
//! Each key resolves through `[hostclass.<name>]`, then `default_<key>` in
//! `[asiaq]`, then (for the `test_*` keys) the `[test]` section, then the
//! built-in default.

use asiaq_core::{DeploymentStrategy, MetanetworkName};

use crate::config::{AsiaqConfig, Lookup};
use crate::error::ConfigResult;

/// Where and how to run a hostclass's integration test.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IntegrationTestSettings {
    /// Hostclass whose instance runs the test command.
    pub hostclass: Option<String>,
    pub user: Option<String>,
    pub command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostclassConfig {
    pub name: String,
    pub meta_network: MetanetworkName,
    pub instance_type: String,
    pub chaos: bool,
    pub deployment_strategy: DeploymentStrategy,
    pub elb: bool,
    /// `+N`, `-N` or a literal address inside the metanetwork.
    pub ip_address: Option<String>,
    pub public_ip: bool,
    pub smoke_test: bool,
    pub deployable: bool,
    pub integration_test: Option<String>,
    pub test: IntegrationTestSettings,
}

pub const DEFAULT_INSTANCE_TYPE: &str = "m5.large";

impl AsiaqConfig {
    /// Settings for `hostclass` as seen from `env`.
    ///
    /// Hostclasses without a section get the defaults.
    pub fn hostclass(&self, hostclass: &str, env: Option<&str>) -> ConfigResult<HostclassConfig> {
        let lookup = Lookup::new(env)
            .layer(format!("hostclass.{hostclass}"), self.hostclass_section(hostclass), "")
            .layer("asiaq", Some(self.asiaq_section()), "default_");
        let test_lookup = Lookup::new(env)
            .layer(format!("hostclass.{hostclass}"), self.hostclass_section(hostclass), "")
            .layer("asiaq", Some(self.asiaq_section()), "default_")
            .layer("test", Some(self.test_section()), "");

        Ok(HostclassConfig {
            name: hostclass.to_string(),
            meta_network: lookup.parse("meta_network")?.unwrap_or(MetanetworkName::Intranet),
            instance_type: lookup
                .non_empty("instance_type")?
                .unwrap_or_else(|| DEFAULT_INSTANCE_TYPE.to_string()),
            chaos: lookup.flag("chaos")?.unwrap_or(true),
            deployment_strategy: lookup.parse("deployment_strategy")?.unwrap_or_default(),
            elb: lookup.flag("elb")?.unwrap_or(false),
            ip_address: lookup.non_empty("ip_address")?,
            public_ip: lookup.flag("public_ip")?.unwrap_or(false),
            smoke_test: lookup.flag("smoke_test")?.unwrap_or(true),
            deployable: lookup.flag("deployable")?.unwrap_or(false),
            integration_test: lookup.non_empty("integration_test")?,
            test: IntegrationTestSettings {
                hostclass: test_lookup.non_empty("test_hostclass")?,
                user: test_lookup.non_empty("test_user")?,
                command: test_lookup.non_empty("test_command")?,
            },
        })
    }
}

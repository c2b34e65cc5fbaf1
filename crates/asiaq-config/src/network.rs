//! Network settings for one environment.

use asiaq_core::MetanetworkName;
use asiaq_network::{
    Cidr, InboundRule, Metanetwork, MetanetworkSpec, NatRoute, PortRange, RangeSpec, TopologySpec,
};

use crate::config::{AsiaqConfig, Lookup, split_list};
use crate::error::{ConfigError, ConfigResult};

/// Resolved `[env.<name>]` over `[envtype.<type>]` network settings.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSettings {
    pub environment: String,
    pub env_type: String,
    /// Space new environment ranges are drawn from.
    pub ip_space: Option<Cidr>,
    /// Fixed environment range; bypasses allocation.
    pub vpc_cidr: Option<Cidr>,
    pub vpc_cidr_size: Option<u8>,
    pub topology: TopologySpec,
}

impl NetworkSettings {
    /// The space this environment's range belongs to.
    pub fn parent_space(&self) -> Cidr {
        self.ip_space.or(self.vpc_cidr).unwrap_or_else(Cidr::any)
    }

    /// Same topology with every metanetwork pinned to its current range.
    ///
    /// Used when re-applying rules and routes to a live environment.
    pub fn pinned_to(&self, current: &[Metanetwork]) -> TopologySpec {
        let mut topology = self.topology.clone();
        for meta in &mut topology.metanetworks {
            if let Some(live) = current.iter().find(|m| m.name == meta.name) {
                meta.range = RangeSpec::Explicit(live.range);
            }
        }
        topology
    }
}

impl AsiaqConfig {
    /// Network settings for `environment`, of type `env_type` when given,
    /// otherwise the type named in its `[env.<name>]` section or the default.
    pub fn network(&self, environment: &str, env_type: Option<&str>) -> ConfigResult<NetworkSettings> {
        let env_section = self.env_section(environment);
        let env_type = match env_type {
            Some(t) => t.to_string(),
            None => {
                let lookup = Lookup::new(Some(environment))
                    .layer(format!("env.{environment}"), env_section, "")
                    .layer("asiaq", Some(self.asiaq_section()), "default_");
                lookup.non_empty("env_type")?.ok_or_else(|| ConfigError::MissingKey {
                    scope: format!("environment {environment}"),
                    key: "env_type".to_string(),
                })?
            }
        };

        let lookup = Lookup::new(Some(environment))
            .layer(format!("env.{environment}"), env_section, "")
            .layer(format!("envtype.{env_type}"), self.envtype_section(&env_type), "");
        let missing = |key: &str| ConfigError::MissingKey {
            scope: format!("environment {environment} ({env_type})"),
            key: key.to_string(),
        };
        let invalid = |key: &str, reason: String| ConfigError::InvalidValue {
            section: lookup.describe(),
            key: key.to_string(),
            reason,
        };

        let ip_space: Option<Cidr> = lookup.parse("ip_space")?;
        let vpc_cidr: Option<Cidr> = lookup.parse("vpc_cidr")?;
        let vpc_cidr_size: Option<u8> = lookup.parse("vpc_cidr_size")?;

        match (vpc_cidr, ip_space, vpc_cidr_size) {
            (Some(cidr), Some(space), _) if !space.contains(&cidr) => {
                return Err(invalid("vpc_cidr", format!("{cidr} is outside ip_space {space}")));
            }
            (Some(_), _, _) => {}
            (None, None, _) => return Err(missing("ip_space")),
            (None, Some(_), None) => return Err(missing("vpc_cidr_size")),
            (None, Some(space), Some(size)) if size < space.prefix_len() || size > 32 => {
                return Err(invalid(
                    "vpc_cidr_size",
                    format!("/{size} does not fit inside {space}"),
                ));
            }
            (None, Some(_), Some(_)) => {}
        }

        let zones = match lookup.list("zones")? {
            Some(zones) if !zones.is_empty() => zones,
            _ => self.settings(Some(environment))?.zones,
        };
        if zones.is_empty() {
            return Err(missing("zones"));
        }

        let names: Vec<MetanetworkName> = match lookup.list("metanetworks")? {
            Some(list) if !list.is_empty() => list
                .iter()
                .map(|n| n.parse().map_err(|e: String| invalid("metanetworks", e)))
                .collect::<ConfigResult<_>>()?,
            _ => MetanetworkName::ALL.to_vec(),
        };

        let mut metanetworks = Vec::with_capacity(names.len());
        for name in names {
            let range = match lookup.non_empty(&format!("{name}_cidr"))?.as_deref() {
                None | Some("auto") => RangeSpec::Auto,
                Some(_) => RangeSpec::Explicit(
                    lookup
                        .parse(&format!("{name}_cidr"))?
                        .ok_or_else(|| missing(&format!("{name}_cidr")))?,
                ),
            };
            let inbound = match lookup.text(&format!("{name}_sg_rules"))? {
                Some(text) => InboundRule::parse_list(&text)
                    .map_err(|e| invalid(&format!("{name}_sg_rules"), e.to_string()))?,
                None => Vec::new(),
            };
            metanetworks.push(MetanetworkSpec {
                name,
                range,
                inbound,
                igw_routes: cidr_list(&lookup, &format!("{name}_igw_routes"))?,
                vgw_routes: cidr_list(&lookup, &format!("{name}_vgw_routes"))?,
            });
        }

        let nat_routes = match lookup.text("nat_gateway_routes")? {
            Some(text) => NatRoute::parse_list(&text)
                .map_err(|e| invalid("nat_gateway_routes", e.to_string()))?,
            None => Vec::new(),
        };
        let customer_ports: Vec<PortRange> = lookup
            .list("customer_ports")?
            .unwrap_or_default()
            .iter()
            .map(|p| p.parse().map_err(|e: asiaq_network::NetworkError| invalid("customer_ports", e.to_string())))
            .collect::<ConfigResult<_>>()?;
        let mut customer_cidrs = cidr_list(&lookup, "customer_cidr")?;
        if !customer_ports.is_empty() && customer_cidrs.is_empty() {
            customer_cidrs.push(Cidr::any());
        }

        Ok(NetworkSettings {
            environment: environment.to_string(),
            env_type,
            ip_space,
            vpc_cidr,
            vpc_cidr_size,
            topology: TopologySpec {
                metanetworks,
                nat_routes,
                customer_ports,
                customer_cidrs,
                zones,
            },
        })
    }
}

fn cidr_list(lookup: &Lookup<'_>, key: &str) -> ConfigResult<Vec<Cidr>> {
    lookup
        .list(key)?
        .unwrap_or_default()
        .iter()
        .map(|c| {
            c.parse().map_err(|e: asiaq_network::NetworkError| ConfigError::InvalidValue {
                section: lookup.describe(),
                key: key.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use asiaq_network::{Gateway, RuleSource};

    const NETWORKS: &str = r#"
[asiaq]
zones = "us-west-2a us-west-2b"
default_env_type = "sandbox"

[envtype.sandbox]
ip_space = "10.0.0.0/8"
vpc_cidr_size = 16
intranet_sg_rules = "tcp all 22"
dmz_cidr = "auto"
dmz_igw_routes = "0.0.0.0/0"
nat_gateway_routes = "intranet/dmz"
customer_ports = "443 8000:8100"

[envtype.production]
ip_space = "10.128.0.0/9"
vpc_cidr_size = 16
metanetworks = "intranet, dmz"

[env.ci]
env_type = "sandbox"
"intranet_sg_rules@ci" = "tcp all 22 80"

[env.fixed]
env_type = "production"
vpc_cidr = "10.200.0.0/16"
intranet_cidr = "10.200.0.0/17"
"#;

    #[test]
    fn envtype_settings_with_env_overrides() {
        let config = AsiaqConfig::parse(NETWORKS).unwrap();
        let ci = config.network("ci", None).unwrap();

        assert_eq!(ci.env_type, "sandbox");
        assert_eq!(ci.ip_space, Some("10.0.0.0/8".parse().unwrap()));
        assert_eq!(ci.vpc_cidr_size, Some(16));
        assert_eq!(ci.topology.zones, vec!["us-west-2a", "us-west-2b"]);
        assert_eq!(ci.topology.metanetworks.len(), 4);

        let intranet = &ci.topology.metanetworks[0];
        assert_eq!(intranet.name, MetanetworkName::Intranet);
        // The @ci override wins over the envtype rule.
        assert_eq!(intranet.inbound.len(), 2);
        assert_eq!(intranet.inbound[0].source, RuleSource::All);

        let dmz = ci
            .topology
            .metanetworks
            .iter()
            .find(|m| m.name == MetanetworkName::Dmz)
            .unwrap();
        assert_eq!(dmz.range, RangeSpec::Auto);
        assert_eq!(dmz.igw_routes, vec![Cidr::any()]);
        assert_eq!(ci.topology.nat_routes.len(), 1);
        assert_eq!(ci.topology.customer_ports.len(), 2);
        assert_eq!(ci.topology.customer_cidrs, vec![Cidr::any()]);
    }

    #[test]
    fn default_env_type_applies_to_unlisted_environments() {
        let config = AsiaqConfig::parse(NETWORKS).unwrap();
        let adhoc = config.network("adhoc", None).unwrap();
        assert_eq!(adhoc.env_type, "sandbox");
        assert_eq!(adhoc.topology.metanetworks[0].inbound.len(), 1);
    }

    #[test]
    fn explicit_ranges_and_subset_of_metanetworks() {
        let config = AsiaqConfig::parse(NETWORKS).unwrap();
        let fixed = config.network("fixed", None).unwrap();

        assert_eq!(fixed.vpc_cidr, Some("10.200.0.0/16".parse().unwrap()));
        assert_eq!(fixed.parent_space(), "10.128.0.0/9".parse().unwrap());
        let names: Vec<_> = fixed.topology.metanetworks.iter().map(|m| m.name).collect();
        assert_eq!(names, vec![MetanetworkName::Intranet, MetanetworkName::Dmz]);
        assert_eq!(
            fixed.topology.metanetworks[0].range,
            RangeSpec::Explicit("10.200.0.0/17".parse().unwrap())
        );
    }

    #[test]
    fn missing_address_space_is_an_error() {
        let config = AsiaqConfig::parse("[asiaq]\nzones = \"a\"\n[envtype.bare]\nvpc_cidr_size = 16\n").unwrap();
        assert!(matches!(
            config.network("x", Some("bare")),
            Err(ConfigError::MissingKey { ref key, .. }) if key == "ip_space"
        ));
    }

    #[test]
    fn missing_env_type_is_an_error() {
        let config = AsiaqConfig::parse("").unwrap();
        assert!(matches!(
            config.network("x", None),
            Err(ConfigError::MissingKey { ref key, .. }) if key == "env_type"
        ));
    }

    #[test]
    fn vpc_cidr_outside_ip_space_is_rejected() {
        let config = AsiaqConfig::parse(
            "[envtype.t]\nip_space = \"10.0.0.0/16\"\nvpc_cidr = \"10.1.0.0/24\"\nzones = \"a\"\n",
        )
        .unwrap();
        assert!(matches!(config.network("x", Some("t")), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn pinned_topology_keeps_live_ranges() {
        let config = AsiaqConfig::parse(NETWORKS).unwrap();
        let ci = config.network("ci", None).unwrap();
        let live = vec![Metanetwork {
            name: MetanetworkName::Dmz,
            range: "10.5.64.0/18".parse().unwrap(),
            subnets: Vec::new(),
            inbound: Vec::new(),
            outbound: vec![asiaq_network::OutboundRoute {
                destination: Cidr::any(),
                gateway: Gateway::Internet,
            }],
        }];
        let pinned = ci.pinned_to(&live);
        let dmz = pinned
            .metanetworks
            .iter()
            .find(|m| m.name == MetanetworkName::Dmz)
            .unwrap();
        assert_eq!(dmz.range, RangeSpec::Explicit("10.5.64.0/18".parse().unwrap()));
        assert_eq!(pinned.metanetworks[0].range, RangeSpec::Auto);
    }
}

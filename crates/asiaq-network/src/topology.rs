//! Metanetwork planning inside an environment range.

use asiaq_core::{MetanetworkName, RandomSource};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::allocator::{allocate, partition, subnet_offset};
use crate::cidr::Cidr;
use crate::error::{NetworkError, NetworkResult};
use crate::rules::{Gateway, InboundRule, NatRoute, OutboundRoute, PortRange, RuleSource};

/// How a metanetwork's range is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// Drawn at random from the free part of the environment range.
    Auto,
    Explicit(Cidr),
}

/// Configured shape of one metanetwork.
#[derive(Debug, Clone, PartialEq)]
pub struct MetanetworkSpec {
    pub name: MetanetworkName,
    pub range: RangeSpec,
    pub inbound: Vec<InboundRule>,
    pub igw_routes: Vec<Cidr>,
    pub vgw_routes: Vec<Cidr>,
}

impl MetanetworkSpec {
    pub fn auto(name: MetanetworkName) -> Self {
        Self {
            name,
            range: RangeSpec::Auto,
            inbound: Vec::new(),
            igw_routes: Vec::new(),
            vgw_routes: Vec::new(),
        }
    }
}

/// Everything needed to lay out an environment's networks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopologySpec {
    pub metanetworks: Vec<MetanetworkSpec>,
    pub nat_routes: Vec<NatRoute>,
    pub customer_ports: Vec<PortRange>,
    pub customer_cidrs: Vec<Cidr>,
    pub zones: Vec<String>,
}

/// A subnet pinned to one availability zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSubnet {
    pub zone: String,
    pub range: Cidr,
}

/// A planned metanetwork with resolved rules and routes.
///
/// Inbound sources never contain [`RuleSource::All`]; it is expanded to one
/// rule per sibling metanetwork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metanetwork {
    pub name: MetanetworkName,
    pub range: Cidr,
    pub subnets: Vec<ZoneSubnet>,
    pub inbound: Vec<InboundRule>,
    pub outbound: Vec<OutboundRoute>,
}

impl Metanetwork {
    /// The subnet ranges in zone order.
    pub fn subnet_ranges(&self) -> Vec<Cidr> {
        self.subnets.iter().map(|s| s.range).collect()
    }
}

/// Lay out every configured metanetwork inside `env_range`.
///
/// Each metanetwork gets a block of `env prefix + ceil(log2 count)`. Explicit
/// ranges are validated for containment and overlap and count as used before
/// the automatic ones are drawn.
pub fn plan_metanetworks(
    env_range: &Cidr,
    spec: &TopologySpec,
    rng: &mut dyn RandomSource,
) -> NetworkResult<Vec<Metanetwork>> {
    if spec.metanetworks.is_empty() {
        return Err(NetworkError::Topology("no metanetworks configured".to_string()));
    }
    if spec.zones.is_empty() {
        return Err(NetworkError::Topology("no availability zones configured".to_string()));
    }
    let names: Vec<MetanetworkName> = spec.metanetworks.iter().map(|m| m.name).collect();
    for (i, name) in names.iter().enumerate() {
        if names[i + 1..].contains(name) {
            return Err(NetworkError::Topology(format!("metanetwork {name} configured twice")));
        }
    }

    let meta_prefix = u32::from(env_range.prefix_len()) + subnet_offset(names.len());
    if meta_prefix > 32 {
        return Err(NetworkError::Topology(format!(
            "{env_range} is too small for {} metanetworks",
            names.len()
        )));
    }

    // Explicit ranges first, so the allocator sees them as taken.
    let mut used: Vec<Cidr> = Vec::new();
    for meta in &spec.metanetworks {
        if let RangeSpec::Explicit(range) = meta.range {
            if !env_range.contains(&range) {
                return Err(NetworkError::NotContained {
                    range,
                    parent: *env_range,
                });
            }
            if let Some(existing) = used.iter().find(|u| u.overlaps(&range)) {
                return Err(NetworkError::OverlapConflict {
                    range,
                    existing: *existing,
                });
            }
            used.push(range);
        }
    }

    let mut ranges = Vec::with_capacity(spec.metanetworks.len());
    for meta in &spec.metanetworks {
        let range = match meta.range {
            RangeSpec::Explicit(range) => range,
            RangeSpec::Auto => {
                let range = allocate(env_range, meta_prefix as u8, &used, rng)?;
                used.push(range);
                range
            }
        };
        ranges.push(range);
    }

    for nat in &spec.nat_routes {
        for name in [nat.from, nat.via] {
            if !names.contains(&name) {
                return Err(NetworkError::InvalidRoute(format!(
                    "nat route references unconfigured metanetwork {name}"
                )));
            }
        }
    }

    let mut planned = Vec::with_capacity(ranges.len());
    for (meta, range) in spec.metanetworks.iter().zip(ranges) {
        let subnets = partition(&range, spec.zones.len())?
            .into_iter()
            .zip(&spec.zones)
            .map(|(range, zone)| ZoneSubnet {
                zone: zone.clone(),
                range,
            })
            .collect();

        let inbound = resolve_inbound(meta, env_range, spec, &names)?;
        let outbound = resolve_outbound(meta, spec);
        debug!(
            metanetwork = %meta.name,
            %range,
            rules = inbound.len(),
            routes = outbound.len(),
            "metanetwork planned"
        );

        planned.push(Metanetwork {
            name: meta.name,
            range,
            subnets,
            inbound,
            outbound,
        });
    }
    Ok(planned)
}

fn resolve_inbound(
    meta: &MetanetworkSpec,
    env_range: &Cidr,
    spec: &TopologySpec,
    names: &[MetanetworkName],
) -> NetworkResult<Vec<InboundRule>> {
    let mut rules = Vec::new();
    for rule in &meta.inbound {
        match rule.source {
            RuleSource::All => {
                for name in names {
                    rules.push(InboundRule::new(
                        &rule.protocol,
                        RuleSource::Metanetwork(*name),
                        rule.ports,
                    ));
                }
            }
            RuleSource::Metanetwork(name) if !names.contains(&name) => {
                return Err(NetworkError::InvalidRule(format!(
                    "{} on {} references unconfigured metanetwork {name}",
                    rule, meta.name
                )));
            }
            _ => rules.push(rule.clone()),
        }
    }

    for ports in &spec.customer_ports {
        match meta.name {
            MetanetworkName::Dmz => {
                for cidr in &spec.customer_cidrs {
                    rules.push(InboundRule::new("tcp", RuleSource::Cidr(*cidr), *ports));
                }
                rules.push(InboundRule::new(
                    "tcp",
                    RuleSource::Metanetwork(MetanetworkName::Dmz),
                    *ports,
                ));
            }
            MetanetworkName::Intranet if names.contains(&MetanetworkName::Dmz) => {
                rules.push(InboundRule::new(
                    "tcp",
                    RuleSource::Metanetwork(MetanetworkName::Dmz),
                    *ports,
                ));
            }
            _ => {}
        }
    }

    rules.push(InboundRule::new("icmp", RuleSource::Cidr(*env_range), PortRange::single(-1)));
    rules.push(InboundRule::new("udp", RuleSource::Cidr(*env_range), PortRange::single(53)));
    Ok(rules)
}

fn resolve_outbound(meta: &MetanetworkSpec, spec: &TopologySpec) -> Vec<OutboundRoute> {
    let mut routes: Vec<OutboundRoute> = meta
        .igw_routes
        .iter()
        .map(|destination| OutboundRoute {
            destination: *destination,
            gateway: Gateway::Internet,
        })
        .chain(meta.vgw_routes.iter().map(|destination| OutboundRoute {
            destination: *destination,
            gateway: Gateway::Vpn,
        }))
        .collect();

    routes.extend(
        spec.nat_routes
            .iter()
            .filter(|nat| nat.from == meta.name)
            .map(|nat| OutboundRoute {
                destination: Cidr::any(),
                gateway: Gateway::Nat(nat.via),
            }),
    );
    routes
}

#[cfg(test)]
mod tests {
    use super::*;
    use asiaq_core::StdRandom;

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    fn spec_with(metanetworks: Vec<MetanetworkSpec>) -> TopologySpec {
        TopologySpec {
            metanetworks,
            zones: vec!["us-west-2a".into(), "us-west-2b".into(), "us-west-2c".into()],
            ..Default::default()
        }
    }

    fn all_auto() -> Vec<MetanetworkSpec> {
        MetanetworkName::ALL.into_iter().map(MetanetworkSpec::auto).collect()
    }

    #[test]
    fn four_auto_networks_fill_quarters() {
        let env = cidr("10.0.0.0/16");
        let mut rng = StdRandom::seeded(5);
        let planned = plan_metanetworks(&env, &spec_with(all_auto()), &mut rng).unwrap();

        assert_eq!(planned.len(), 4);
        for (i, a) in planned.iter().enumerate() {
            assert_eq!(a.range.prefix_len(), 18);
            assert!(env.contains(&a.range));
            assert_eq!(a.subnets.len(), 3);
            assert!(a.subnets.iter().all(|s| a.range.contains(&s.range)));
            for b in &planned[i + 1..] {
                assert!(!a.range.overlaps(&b.range));
            }
        }
    }

    #[test]
    fn explicit_ranges_are_kept_and_avoided() {
        let env = cidr("10.0.0.0/16");
        let mut metas = all_auto();
        metas[2].range = RangeSpec::Explicit(cidr("10.0.0.0/18"));
        let mut rng = StdRandom::seeded(9);

        let planned = plan_metanetworks(&env, &spec_with(metas), &mut rng).unwrap();
        assert_eq!(planned[2].range, cidr("10.0.0.0/18"));
        for (i, m) in planned.iter().enumerate() {
            if i != 2 {
                assert!(!m.range.overlaps(&planned[2].range));
            }
        }
    }

    #[test]
    fn explicit_range_outside_environment_is_rejected() {
        let env = cidr("10.0.0.0/16");
        let mut metas = all_auto();
        metas[0].range = RangeSpec::Explicit(cidr("10.1.0.0/18"));
        let mut rng = StdRandom::seeded(1);
        assert!(matches!(
            plan_metanetworks(&env, &spec_with(metas), &mut rng),
            Err(NetworkError::NotContained { .. })
        ));
    }

    #[test]
    fn overlapping_explicit_ranges_are_rejected() {
        let env = cidr("10.0.0.0/16");
        let mut metas = all_auto();
        metas[0].range = RangeSpec::Explicit(cidr("10.0.0.0/18"));
        metas[1].range = RangeSpec::Explicit(cidr("10.0.32.0/19"));
        let mut rng = StdRandom::seeded(1);
        assert!(matches!(
            plan_metanetworks(&env, &spec_with(metas), &mut rng),
            Err(NetworkError::OverlapConflict { .. })
        ));
    }

    #[test]
    fn all_source_expands_and_implicit_rules_added() {
        let env = cidr("10.0.0.0/16");
        let mut metas = vec![
            MetanetworkSpec::auto(MetanetworkName::Intranet),
            MetanetworkSpec::auto(MetanetworkName::Dmz),
        ];
        metas[0].inbound = InboundRule::parse_list("tcp all 22").unwrap();
        let mut rng = StdRandom::seeded(2);

        let planned = plan_metanetworks(&env, &spec_with(metas), &mut rng).unwrap();
        let intranet = &planned[0];
        assert_eq!(intranet.inbound.len(), 4);
        assert!(intranet.inbound.contains(&InboundRule::new(
            "tcp",
            RuleSource::Metanetwork(MetanetworkName::Dmz),
            PortRange::single(22)
        )));
        assert!(intranet.inbound.contains(&InboundRule::new(
            "udp",
            RuleSource::Cidr(env),
            PortRange::single(53)
        )));
        assert!(!intranet.inbound.iter().any(|r| r.source == RuleSource::All));
    }

    #[test]
    fn customer_ports_open_dmz_and_intranet() {
        let env = cidr("10.0.0.0/16");
        let mut spec = spec_with(vec![
            MetanetworkSpec::auto(MetanetworkName::Intranet),
            MetanetworkSpec::auto(MetanetworkName::Dmz),
        ]);
        spec.customer_ports = vec![PortRange::single(443)];
        spec.customer_cidrs = vec![cidr("0.0.0.0/0")];
        let mut rng = StdRandom::seeded(2);

        let planned = plan_metanetworks(&env, &spec, &mut rng).unwrap();
        let dmz_rule = InboundRule::new("tcp", RuleSource::Cidr(cidr("0.0.0.0/0")), PortRange::single(443));
        let from_dmz = InboundRule::new(
            "tcp",
            RuleSource::Metanetwork(MetanetworkName::Dmz),
            PortRange::single(443),
        );
        assert!(planned[1].inbound.contains(&dmz_rule));
        assert!(planned[0].inbound.contains(&from_dmz));
        assert!(!planned[0].inbound.contains(&dmz_rule));
    }

    #[test]
    fn routes_per_gateway() {
        let env = cidr("10.0.0.0/16");
        let mut metas = vec![
            MetanetworkSpec::auto(MetanetworkName::Intranet),
            MetanetworkSpec::auto(MetanetworkName::Dmz),
        ];
        metas[1].igw_routes = vec![Cidr::any()];
        metas[0].vgw_routes = vec![cidr("172.16.0.0/12")];
        let mut spec = spec_with(metas);
        spec.nat_routes = NatRoute::parse_list("intranet/dmz").unwrap();
        let mut rng = StdRandom::seeded(4);

        let planned = plan_metanetworks(&env, &spec, &mut rng).unwrap();
        assert_eq!(
            planned[0].outbound,
            vec![
                OutboundRoute {
                    destination: cidr("172.16.0.0/12"),
                    gateway: Gateway::Vpn
                },
                OutboundRoute {
                    destination: Cidr::any(),
                    gateway: Gateway::Nat(MetanetworkName::Dmz)
                },
            ]
        );
        assert_eq!(planned[1].outbound[0].gateway, Gateway::Internet);
    }

    #[test]
    fn nat_route_to_missing_network_is_rejected() {
        let env = cidr("10.0.0.0/16");
        let mut spec = spec_with(vec![MetanetworkSpec::auto(MetanetworkName::Intranet)]);
        spec.nat_routes = NatRoute::parse_list("intranet/dmz").unwrap();
        let mut rng = StdRandom::seeded(4);
        assert!(matches!(
            plan_metanetworks(&env, &spec, &mut rng),
            Err(NetworkError::InvalidRoute(_))
        ));
    }

    #[test]
    fn empty_topology_is_rejected() {
        let mut rng = StdRandom::seeded(0);
        assert!(plan_metanetworks(&cidr("10.0.0.0/16"), &spec_with(vec![]), &mut rng).is_err());
    }
}

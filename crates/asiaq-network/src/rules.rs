//! Inbound rule and outbound route settings.
//!
//! Rules are written as comma-separated `protocol source port [port...]`
//! entries, for example `tcp all 22, udp 10.0.0.0/8 53 8000:8100`. Each port
//! token yields one rule.

use std::fmt;
use std::str::FromStr;

use asiaq_core::MetanetworkName;
use serde::{Deserialize, Serialize};

use crate::cidr::Cidr;
use crate::error::{NetworkError, NetworkResult};

/// Inclusive port range. ICMP uses `-1` for "any type".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub from: i32,
    pub to: i32,
}

impl PortRange {
    pub fn single(port: i32) -> Self {
        Self { from: port, to: port }
    }
}

impl FromStr for PortRange {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<i32>()
                .ok()
                .filter(|v| (-1..=65535).contains(v))
                .ok_or_else(|| NetworkError::InvalidRule(format!("bad port '{s}'")))
        };
        let range = match s.split_once(':') {
            Some((from, to)) => PortRange {
                from: parse(from)?,
                to: parse(to)?,
            },
            None => PortRange::single(parse(s)?),
        };
        if range.from > range.to {
            return Err(NetworkError::InvalidRule(format!("port range '{s}' is reversed")));
        }
        Ok(range)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}:{}", self.from, self.to)
        }
    }
}

/// Where inbound traffic may originate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RuleSource {
    Cidr(Cidr),
    Metanetwork(MetanetworkName),
    /// Every metanetwork of the environment. Expanded during planning.
    All,
}

impl FromStr for RuleSource {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            Ok(RuleSource::All)
        } else if s.contains('/') {
            Ok(RuleSource::Cidr(s.parse()?))
        } else {
            s.parse::<MetanetworkName>()
                .map(RuleSource::Metanetwork)
                .map_err(NetworkError::InvalidRule)
        }
    }
}

impl fmt::Display for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSource::Cidr(c) => write!(f, "{c}"),
            RuleSource::Metanetwork(n) => write!(f, "{n}"),
            RuleSource::All => f.write_str("all"),
        }
    }
}

/// One allowed inbound flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRule {
    pub protocol: String,
    pub source: RuleSource,
    pub ports: PortRange,
}

impl InboundRule {
    pub fn new(protocol: &str, source: RuleSource, ports: PortRange) -> Self {
        Self {
            protocol: protocol.to_string(),
            source,
            ports,
        }
    }

    /// Parse a comma-separated rule list. Blank entries are skipped.
    pub fn parse_list(spec: &str) -> NetworkResult<Vec<InboundRule>> {
        let mut rules = Vec::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut tokens = entry.split_whitespace();
            let (Some(protocol), Some(source)) = (tokens.next(), tokens.next()) else {
                return Err(NetworkError::InvalidRule(entry.to_string()));
            };
            let protocol = protocol.to_ascii_lowercase();
            if !matches!(protocol.as_str(), "tcp" | "udp" | "icmp" | "-1") {
                return Err(NetworkError::InvalidRule(entry.to_string()));
            }
            let source: RuleSource = source.parse()?;
            let ports: Vec<&str> = tokens.collect();
            if ports.is_empty() {
                return Err(NetworkError::InvalidRule(entry.to_string()));
            }
            for port in ports {
                rules.push(InboundRule::new(&protocol, source, port.parse()?));
            }
        }
        Ok(rules)
    }
}

impl fmt::Display for InboundRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.protocol, self.source, self.ports)
    }
}

/// Egress target of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "via", rename_all = "snake_case")]
pub enum Gateway {
    Internet,
    Vpn,
    /// NAT gateway placed in another metanetwork.
    Nat(MetanetworkName),
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gateway::Internet => f.write_str("igw"),
            Gateway::Vpn => f.write_str("vgw"),
            Gateway::Nat(net) => write!(f, "nat@{net}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRoute {
    pub destination: Cidr,
    pub gateway: Gateway,
}

impl OutboundRoute {
    /// Parse a space-separated list of destination CIDRs for one gateway.
    pub fn parse_list(spec: &str, gateway: Gateway) -> NetworkResult<Vec<OutboundRoute>> {
        spec.split_whitespace()
            .map(|dest| {
                let destination = dest
                    .parse()
                    .map_err(|_| NetworkError::InvalidRoute(format!("bad destination '{dest}'")))?;
                Ok(OutboundRoute {
                    destination,
                    gateway,
                })
            })
            .collect()
    }
}

/// `from/via`: traffic from `from` leaves through a NAT gateway in `via`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRoute {
    pub from: MetanetworkName,
    pub via: MetanetworkName,
}

impl NatRoute {
    /// Parse a space-separated list of `from/via` pairs.
    pub fn parse_list(spec: &str) -> NetworkResult<Vec<NatRoute>> {
        spec.split_whitespace()
            .map(|pair| {
                let (from, via) = pair
                    .split_once('/')
                    .ok_or_else(|| NetworkError::InvalidRoute(format!("expected from/via, got '{pair}'")))?;
                let from = from.parse().map_err(NetworkError::InvalidRoute)?;
                let via = via.parse().map_err(NetworkError::InvalidRoute)?;
                if from == via {
                    return Err(NetworkError::InvalidRoute(format!("'{pair}' routes through itself")));
                }
                Ok(NatRoute { from, via })
            })
            .collect()
    }
}

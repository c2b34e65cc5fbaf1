//! asiaq-network: address planning for environments.
//!
//! Hands out disjoint IPv4 ranges for environments and splits each one into
//! metanetworks and per-zone subnets. Also parses the textual inbound rule
//! and outbound route settings into typed values.
//!
//! # Architecture
//!
//! ```text
//! parent space (ip_space)
//!   └── Environment range        ← allocate(parent, prefix, existing, rng)
//!       ├── intranet             ← plan_metanetworks(...)
//!       │   ├── zone a subnet    ← partition(range, zones)
//!       │   └── zone b subnet
//!       ├── tunnel
//!       ├── dmz
//!       └── maintenance
//! ```
//!
//! Nothing here touches storage; callers decide where the results live.

pub mod allocator;
pub mod cidr;
pub mod error;
pub mod rules;
pub mod topology;

pub use allocator::{allocate, partition, subnet_offset};
pub use cidr::Cidr;
pub use error::{NetworkError, NetworkResult};
pub use rules::{Gateway, InboundRule, NatRoute, OutboundRoute, PortRange, RuleSource};
pub use topology::{Metanetwork, MetanetworkSpec, RangeSpec, TopologySpec, ZoneSubnet, plan_metanetworks};

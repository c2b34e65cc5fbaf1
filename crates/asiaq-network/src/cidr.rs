//! IPv4 CIDR blocks.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};

/// An aligned IPv4 block: base address plus prefix length.
///
/// The base is always masked to the prefix, so two `Cidr`s compare equal
/// exactly when they cover the same addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    base: u32,
    prefix_len: u8,
}

impl Cidr {
    /// Create a block, masking `address` down to the prefix.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> NetworkResult<Self> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {prefix_len} exceeds 32"
            )));
        }
        Ok(Self {
            base: u32::from(address) & mask(prefix_len),
            prefix_len,
        })
    }

    /// Build from an already-aligned numeric base.
    pub(crate) fn from_raw(base: u32, prefix_len: u8) -> Self {
        Self {
            base: base & mask(prefix_len),
            prefix_len,
        }
    }

    /// Parse `a.b.c.d/len`.
    pub fn from_cidr(s: &str) -> NetworkResult<Self> {
        let s = s.trim();
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!("missing '/' in CIDR: {s}")));
        };
        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;
        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;
        Self::new(address, prefix_len)
    }

    /// The whole IPv4 space.
    pub fn any() -> Self {
        Self::from_raw(0, 0)
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }

    /// First address as an integer.
    pub fn first(&self) -> u32 {
        self.base
    }

    /// Last address as an integer.
    pub fn last(&self) -> u32 {
        (u64::from(self.base) + self.size() - 1) as u32
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.last())
    }

    pub fn contains_addr(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix_len) == self.base
    }

    /// True when `other` lies wholly inside `self`.
    pub fn contains(&self, other: &Cidr) -> bool {
        other.prefix_len >= self.prefix_len && other.base & mask(self.prefix_len) == self.base
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }

    /// The `index`-th aligned sub-block of length `prefix_len`, if it exists.
    pub fn subnet(&self, prefix_len: u8, index: u64) -> Option<Cidr> {
        if prefix_len < self.prefix_len || prefix_len > 32 {
            return None;
        }
        let count = 1u64 << (prefix_len - self.prefix_len);
        if index >= count {
            return None;
        }
        let block = 1u64 << (32 - u32::from(prefix_len));
        Some(Cidr::from_raw(
            (u64::from(self.base) + index * block) as u32,
            prefix_len,
        ))
    }

    /// All aligned sub-blocks of length `prefix_len`, in address order.
    pub fn subnets(&self, prefix_len: u8) -> NetworkResult<impl Iterator<Item = Cidr> + '_> {
        if prefix_len < self.prefix_len || prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "/{prefix_len} cannot subdivide {self}"
            )));
        }
        let count = 1u64 << (prefix_len - self.prefix_len);
        Ok((0..count).filter_map(move |i| self.subnet(prefix_len, i)))
    }

    /// Resolve an address setting against this block.
    ///
    /// `+N` counts forward from the network address, `-N` backward from the
    /// last address, anything else must be a literal address inside the block.
    pub fn resolve_address(&self, spec: &str) -> NetworkResult<Ipv4Addr> {
        let spec = spec.trim();
        let resolved = if let Some(n) = spec.strip_prefix('+') {
            let n: u64 = n
                .parse()
                .map_err(|_| NetworkError::InvalidOffset(spec.to_string()))?;
            u64::from(self.first()).checked_add(n)
        } else if let Some(n) = spec.strip_prefix('-') {
            let n: u64 = n
                .parse()
                .map_err(|_| NetworkError::InvalidOffset(spec.to_string()))?;
            u64::from(self.last()).checked_sub(n)
        } else {
            let addr = Ipv4Addr::from_str(spec)
                .map_err(|_| NetworkError::InvalidAddress(spec.to_string()))?;
            Some(u64::from(u32::from(addr)))
        };

        match resolved {
            Some(v) if v >= u64::from(self.first()) && v <= u64::from(self.last()) => {
                Ok(Ipv4Addr::from(v as u32))
            }
            _ => Err(NetworkError::InvalidOffset(format!("{spec} falls outside {self}"))),
        }
    }
}

/// Netmask for a prefix length.
fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cidr::from_cidr(s)
    }
}

impl TryFrom<String> for Cidr {
    type Error = NetworkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Cidr::from_cidr(&value)
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}

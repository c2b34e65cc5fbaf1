//! Randomized CIDR allocation.
//!
//! ```text
//! candidates = aligned /prefix blocks inside parent
//! free       = candidates not overlapping any existing range
//!
//! candidates ≤ MAX_ENUMERATED_CANDIDATES → enumerate free, pick one uniformly
//! otherwise                              → draw offsets, up to MAX_RANDOM_DRAWS
//! ```
//!
//! Random placement keeps sibling environments from clustering at the start
//! of the parent space, which keeps later explicit ranges from colliding.

use asiaq_core::RandomSource;
use tracing::debug;

use crate::cidr::Cidr;
use crate::error::{NetworkError, NetworkResult};

/// Largest candidate count that is enumerated exhaustively.
pub const MAX_ENUMERATED_CANDIDATES: u64 = 1 << 16;

/// Draw budget when the candidate space is too large to enumerate.
pub const MAX_RANDOM_DRAWS: u32 = 4096;

/// Pick a free `/prefix_len` block inside `parent`.
///
/// The result is aligned, contained in `parent`, and disjoint from every
/// range in `existing`. Ranges in `existing` that lie outside `parent` are
/// ignored.
pub fn allocate(
    parent: &Cidr,
    prefix_len: u8,
    existing: &[Cidr],
    rng: &mut dyn RandomSource,
) -> NetworkResult<Cidr> {
    if prefix_len < parent.prefix_len() || prefix_len > 32 {
        return Err(NetworkError::InvalidPrefix(format!(
            "cannot carve a /{prefix_len} out of {parent}"
        )));
    }

    let relevant: Vec<Cidr> = existing
        .iter()
        .filter(|range| range.overlaps(parent))
        .copied()
        .collect();
    let is_free = |candidate: &Cidr| !relevant.iter().any(|used| used.overlaps(candidate));
    let candidates = 1u64 << (prefix_len - parent.prefix_len());

    let chosen = if candidates <= MAX_ENUMERATED_CANDIDATES {
        let free: Vec<Cidr> = (0..candidates)
            .filter_map(|i| parent.subnet(prefix_len, i))
            .filter(|c| is_free(c))
            .collect();
        debug!(%parent, prefix_len, free = free.len(), candidates, "enumerated candidates");
        match free.len() {
            0 => None,
            n => Some(free[rng.below(n as u64) as usize]),
        }
    } else {
        (0..MAX_RANDOM_DRAWS)
            .filter_map(|_| parent.subnet(prefix_len, rng.below(candidates)))
            .find(|c| is_free(c))
    };

    chosen.ok_or(NetworkError::AllocationExhausted {
        parent: *parent,
        prefix_len,
    })
}

/// Split `range` into `2^ceil(log2 n)` equal blocks and return the first `n`.
pub fn partition(range: &Cidr, n: usize) -> NetworkResult<Vec<Cidr>> {
    if n == 0 {
        return Err(NetworkError::Partition {
            range: *range,
            reason: "zero subnets requested".to_string(),
        });
    }
    let prefix_len = u32::from(range.prefix_len()) + subnet_offset(n);
    if prefix_len > 32 {
        return Err(NetworkError::Partition {
            range: *range,
            reason: format!("{n} subnets would need a /{prefix_len}"),
        });
    }
    Ok(range.subnets(prefix_len as u8)?.take(n).collect())
}

/// Extra prefix bits needed to hold `n` equal blocks: `ceil(log2 n)`.
pub fn subnet_offset(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        n.next_power_of_two().trailing_zeros()
    }
}

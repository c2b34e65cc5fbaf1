//! Shared types used across Asiaq crates.
//!
//! Everything here is free of I/O: small enums that appear in configuration,
//! persisted records, and log lines, plus the [`RandomSource`] seam that the
//! network allocator, the local cloud and the chaos selector draw from.

pub mod random;
pub mod types;

pub use random::{RandomSource, ScriptedRandom, StdRandom, choose_index, sample_without_replacement};
pub use types::*;

//! Ledger configuration: segment size, lineage depth, Merkle batch cap.
//!
//! A plain, `serde`-first struct with a [`Default`] carrying the spec's
//! stated defaults, constructible directly or loaded from a TOML file.
//! There is no bespoke config DSL; this mirrors the teacher workspace's
//! preference for `serde`-backed configuration over a parser of its own.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Number of WAL entries between automatic segment compactions.
pub const DEFAULT_SEGMENT_SIZE: usize = 1024;
/// Default maximum lineage walk depth (callers may raise it explicitly).
pub const DEFAULT_LINEAGE_DEPTH_CAP: usize = 10;
/// Soft cap on leaves in a single Merkle batch (advisory, memory-bound in practice).
pub const DEFAULT_MERKLE_BATCH_CAP: usize = 1_000_000;

/// Tunables for a [`crate::Ledger`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// WAL entries accumulated before the writer compacts them into the segment file.
    pub segment_size: usize,
    /// Maximum depth a `lineage` walk will traverse before raising `DepthCapExceeded`.
    pub lineage_depth_cap: usize,
    /// Maximum leaves accepted in a single `anchor_batch`/`build_packet` call.
    pub merkle_batch_cap: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            segment_size: DEFAULT_SEGMENT_SIZE,
            lineage_depth_cap: DEFAULT_LINEAGE_DEPTH_CAP,
            merkle_batch_cap: DEFAULT_MERKLE_BATCH_CAP,
        }
    }
}

impl LedgerConfig {
    /// Load a config from a TOML file, falling back to documented defaults
    /// for any field the file omits.
    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

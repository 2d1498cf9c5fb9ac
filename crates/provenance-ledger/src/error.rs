//! Ledger failure modes.

use provenance_merkle::MerkleError;
use provenance_spec::{EncodingError, EnvelopeError, InvariantViolation};
use thiserror::Error;

/// Everything that can go wrong ingesting into, or reading from, a ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The receipt envelope rejected the stamp request.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// A payload could not be canonicalized.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// The Merkle engine could not build a root or proof for an anchoring request.
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    /// One of I1-I5 did not hold.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    /// A lineage walk encountered a cycle, which should be impossible under I3
    /// plus monotone sequencing but is checked defensively.
    #[error("lineage walk encountered a cycle at digest {0}")]
    CycleDetected(String),
    /// A lineage or query operation requested more than the configured cap.
    #[error("requested depth {requested} exceeds the configured lineage cap {cap}")]
    DepthCapExceeded {
        /// Depth the caller asked for.
        requested: usize,
        /// The ledger's configured cap.
        cap: usize,
    },
    /// A Merkle batch requested more leaves than the configured soft cap.
    #[error("batch of {len} leaves exceeds the configured merkle batch cap {cap}")]
    BatchCapExceeded {
        /// Number of leaves requested.
        len: usize,
        /// The ledger's configured cap.
        cap: usize,
    },
    /// A digest was not found in the ledger.
    #[error("digest {0} not found")]
    NotFound(String),
    /// Persistence (file I/O, (de)serialization) failed.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

//! Shared error taxonomy.
//!
//! Errors that more than one component needs to raise (the canonicalizer's
//! failure mode, the envelope's, and the cross-cutting invariant violations
//! I1-I5) live here so downstream crates can wrap them with `#[from]` rather
//! than redefining them.

use thiserror::Error;

/// Canonicalization failed on malformed input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// A string value was not valid UTF-8.
    #[error("invalid UTF-8 in string input")]
    InvalidUtf8,
    /// A number was NaN or infinite and has no canonical textual form.
    #[error("non-finite number cannot be canonicalized")]
    NonFiniteNumber,
    /// A `serde_json::Number` carried neither an integer nor a float representation.
    #[error("number has no stable textual representation")]
    UnrepresentableNumber,
}

/// The receipt envelope rejected a stamp request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// `type` was not a registered receipt type.
    #[error("receipt type `{0}` is not registered")]
    UnknownReceiptType(String),
    /// The payload carried a field reserved for the envelope itself.
    #[error("payload contains reserved field `{0}`")]
    InvariantFieldCollision(String),
    /// The payload could not be canonicalized.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// One of the five data-model invariants (I1-I5) did not hold.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// I1: a receipt's stamped `payload_hash` does not match its recomputed payload hash.
    #[error("I1: payload_hash mismatch, stamped {stamped}, recomputed {recomputed}")]
    PayloadHashMismatch {
        /// The digest stamped on the receipt.
        stamped: String,
        /// The digest recomputed from the receipt's current payload.
        recomputed: String,
    },
    /// I2: the next sequence number for a tenant was not strictly monotone and gap-free.
    #[error("I2: tenant {tenant} expected sequence {expected}, got {got}")]
    SequenceNotMonotone {
        /// Tenant whose sequence was violated.
        tenant: String,
        /// The sequence number that should have been assigned next.
        expected: u64,
        /// The sequence number that was actually supplied or observed.
        got: u64,
    },
    /// I3: a `parent_hash` did not resolve to an existing receipt in the same tenant.
    #[error("I3: parent_hash {parent} not found in tenant {tenant}")]
    ParentNotFound {
        /// The missing parent digest.
        parent: String,
        /// The tenant the lookup was scoped to.
        tenant: String,
    },
    /// I4: a recomputed Merkle root did not match the root an anchor receipt published.
    #[error("I4: recomputed root {recomputed} does not match published root {published}")]
    RootMismatch {
        /// The root an anchor or packet receipt recorded.
        published: String,
        /// The root recomputed from the supplied leaf set.
        recomputed: String,
    },
    /// I5: a decision packet's claim-coverage fell below the fixed threshold.
    #[error("I5: claim coverage {match_rate:.4} is below threshold {threshold:.4}")]
    CoverageBelowThreshold {
        /// Observed `attached / total_claims` ratio.
        match_rate: f64,
        /// The fixed coverage threshold (0.999).
        threshold: f64,
    },
}

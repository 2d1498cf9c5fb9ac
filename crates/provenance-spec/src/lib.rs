//! Composite digests, canonical encoding, and the receipt envelope
//! vocabulary shared by every crate in the provenance workspace.
//!
//! This crate has no I/O and no locking; everything here is a pure function
//! or a plain value type so it can be shared lock-free across threads.

#![deny(missing_docs)]

pub mod canonical;
pub mod envelope;
pub mod error;
pub mod hash;

pub use canonical::{canonicalize, canonicalize_map, canonicalize_raw_bytes};
pub use envelope::{
    emit, Receipt, ReceiptType, Tenant, TypeRegistry, DEFAULT_TENANT, RESERVED_FIELDS,
};
pub use error::{EncodingError, EnvelopeError, InvariantViolation};
pub use hash::{
    combine_digests, composite_digest, empty_sentinel_digest, CompositeDigest, EMPTY_SENTINEL,
    HASH_ALGORITHMS,
};

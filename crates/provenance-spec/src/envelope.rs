//! The receipt envelope: the four required fields every receipt carries,
//! the closed type vocabulary, and the pure `emit` constructor.

use std::collections::HashSet;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::canonicalize_map;
use crate::error::EnvelopeError;
use crate::hash::{composite_digest, CompositeDigest};

/// Opaque tenant namespace identifier.
pub type Tenant = String;

/// Default tenant used when a caller does not supply one explicitly.
pub const DEFAULT_TENANT: &str = "default";

/// Fields stamped by the envelope; a caller-supplied payload must not define them.
pub const RESERVED_FIELDS: [&str; 3] = ["ts", "receipt_type", "payload_hash"];

/// The closed vocabulary of receipt types the engine recognizes natively,
/// plus an `Extension` arm for collaborator-registered tags. Modeled as a
/// sum type rather than a bare string so a match on `receipt_type` is
/// exhaustive and payload interpretation can dispatch per variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReceiptType {
    /// A unit of pipeline work was accepted into the ledger.
    Ingest,
    /// A batch of receipts was anchored under a Merkle root.
    Anchor,
    /// An inclusion proof or root was checked against the ledger.
    Verify,
    /// A decision packet was built.
    Packet,
    /// A claim was attached to a set of supporting receipts.
    Attach,
    /// A consistency check ran (e.g. offline/online reconciliation).
    Consistency,
    /// A halting error was raised and the offending operation stopped.
    Halt,
    /// An invariant violation or SLO breach was detected.
    Anomaly,
    /// A prior receipt's payload was redacted.
    Redaction,
    /// A receipt was appended to an offline queue.
    OfflineEnqueue,
    /// An offline queue was synced against the main ledger.
    OfflineSync,
    /// A collaborator-registered tag outside the built-in vocabulary.
    Extension(String),
}

impl ReceiptType {
    /// The wire string for this receipt type.
    pub fn as_str(&self) -> &str {
        match self {
            ReceiptType::Ingest => "ingest",
            ReceiptType::Anchor => "anchor",
            ReceiptType::Verify => "verify",
            ReceiptType::Packet => "packet",
            ReceiptType::Attach => "attach",
            ReceiptType::Consistency => "consistency",
            ReceiptType::Halt => "halt",
            ReceiptType::Anomaly => "anomaly",
            ReceiptType::Redaction => "redaction",
            ReceiptType::OfflineEnqueue => "offline_enqueue",
            ReceiptType::OfflineSync => "offline_sync",
            ReceiptType::Extension(tag) => tag.as_str(),
        }
    }

    /// Whether this tag is part of the built-in closed vocabulary, as
    /// opposed to a collaborator-registered extension.
    pub fn is_builtin(&self) -> bool {
        !matches!(self, ReceiptType::Extension(_))
    }
}

impl From<String> for ReceiptType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ingest" => ReceiptType::Ingest,
            "anchor" => ReceiptType::Anchor,
            "verify" => ReceiptType::Verify,
            "packet" => ReceiptType::Packet,
            "attach" => ReceiptType::Attach,
            "consistency" => ReceiptType::Consistency,
            "halt" => ReceiptType::Halt,
            "anomaly" => ReceiptType::Anomaly,
            "redaction" => ReceiptType::Redaction,
            "offline_enqueue" => ReceiptType::OfflineEnqueue,
            "offline_sync" => ReceiptType::OfflineSync,
            _ => ReceiptType::Extension(s),
        }
    }
}

impl From<ReceiptType> for String {
    fn from(t: ReceiptType) -> String {
        t.as_str().to_string()
    }
}

/// Tracks additional receipt-type tags registered by collaborators beyond
/// the built-in closed vocabulary. Built-in tags are always registered;
/// extension tags must be registered explicitly before `emit` accepts them.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    extensions: HashSet<String>,
}

impl TypeRegistry {
    /// A registry recognizing only the built-in vocabulary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collaborator-defined extension tag.
    pub fn register(&mut self, tag: impl Into<String>) -> &mut Self {
        self.extensions.insert(tag.into());
        self
    }

    /// Whether `t` may be stamped by `emit`.
    pub fn is_registered(&self, t: &ReceiptType) -> bool {
        match t {
            ReceiptType::Extension(tag) => self.extensions.contains(tag),
            _ => true,
        }
    }
}

/// An immutable receipt: the four required fields, plus whatever
/// `receipt_type`-specific fields the payload carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// Tag identifying what kind of operation this receipt records.
    pub receipt_type: ReceiptType,
    /// ISO-8601 UTC emission timestamp, trailing `Z`.
    pub ts: String,
    /// Opaque tenant namespace, `"default"` unless set explicitly.
    pub tenant_id: Tenant,
    /// `composite_digest(canonicalize(payload))`.
    pub payload_hash: CompositeDigest,
    /// Type-specific fields, flattened alongside the required fields on the wire.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Receipt {
    /// Recompute the payload hash from the receipt's current payload fields.
    /// Compare against `self.payload_hash` to check invariant I1.
    pub fn recompute_payload_hash(&self) -> Result<CompositeDigest, crate::error::EncodingError> {
        canonicalize_map(&self.payload).map(|bytes| composite_digest(&bytes))
    }

    /// Canonicalize the full receipt (all four required fields plus payload)
    /// into the bytes a Merkle leaf is built from.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, crate::error::EncodingError> {
        let value = serde_json::to_value(self).expect("Receipt always serializes to JSON");
        crate::canonical::canonicalize(&value)
    }

    /// The leaf digest this receipt contributes to a Merkle tree:
    /// `composite_digest(canonicalize(receipt))`.
    pub fn leaf_digest(&self) -> Result<CompositeDigest, crate::error::EncodingError> {
        self.canonical_bytes().map(|b| composite_digest(&b))
    }
}

fn now_iso8601_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Stamp a user-supplied `(type, payload, tenant)` into a full receipt.
///
/// Fails with `UnknownReceiptType` if `receipt_type` is not registered, or
/// `InvariantFieldCollision` if `payload` contains any of [`RESERVED_FIELDS`].
/// This constructor is pure: it performs no I/O and does not hand the
/// receipt to a ledger. Callers that want the side effect described in the
/// external interface (ledger indexing plus a canonical stream write) use
/// `Ledger::emit_and_ingest`, which wraps this function.
pub fn emit(
    receipt_type: ReceiptType,
    payload: Map<String, Value>,
    tenant: Option<Tenant>,
    registry: &TypeRegistry,
) -> Result<Receipt, EnvelopeError> {
    if !registry.is_registered(&receipt_type) {
        return Err(EnvelopeError::UnknownReceiptType(
            receipt_type.as_str().to_string(),
        ));
    }
    for reserved in RESERVED_FIELDS {
        if payload.contains_key(reserved) {
            return Err(EnvelopeError::InvariantFieldCollision(reserved.to_string()));
        }
    }
    let canon = canonicalize_map(&payload)?;
    let payload_hash = composite_digest(&canon);
    Ok(Receipt {
        receipt_type,
        ts: now_iso8601_utc(),
        tenant_id: tenant.unwrap_or_else(|| DEFAULT_TENANT.to_string()),
        payload_hash,
        payload,
    })
}

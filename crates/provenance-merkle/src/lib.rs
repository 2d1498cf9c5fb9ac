//! Deterministic Merkle tree construction, inclusion proofs, and
//! verification over an ordered list of composite-digest leaves.
//!
//! Grounded on the duplicate-last-entry odd-fanout rule: whenever a level
//! has an odd number of entries, the last entry is paired with itself
//! before hashing up to the next level. Parents are hashed over the
//! concatenation of child digest *strings*, not raw bytes, so the tree
//! produces the same root regardless of which language built it.

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

use provenance_spec::{combine_digests, empty_sentinel_digest, CompositeDigest, EncodingError, Receipt};

/// Which side of a parent node the sibling digest sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The sibling is combined to the left of the current digest.
    Left,
    /// The sibling is combined to the right of the current digest.
    Right,
}

/// One step of an inclusion proof: a sibling digest and which side it sits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// The sibling digest at this level.
    pub sibling: CompositeDigest,
    /// Which side of the current digest the sibling combines on.
    pub side: Side,
}

/// An ordered sequence of proof steps from leaf to root.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InclusionProof {
    /// Steps in leaf-to-root order.
    pub steps: Vec<ProofStep>,
}

/// A proof step as it might arrive from an untrusted external source (hand
/// authored JSON, a foreign implementation) before being validated.
#[derive(Debug, Clone, Deserialize)]
pub struct RawProofStep {
    /// The sibling digest string, if present.
    pub sibling: Option<String>,
    /// The side tag, if present.
    pub side: Option<Side>,
}

/// Merkle engine failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MerkleError {
    /// A receipt could not be canonicalized into a leaf digest.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// The proof was empty but the candidate leaf does not equal the expected root.
    #[error("proof is empty but the leaf digest does not match the expected root")]
    EmptyProofAgainstNonemptyRoot,
    /// A raw proof step arrived without both a sibling and a side.
    #[error("proof step at position {0} is missing a sibling or a side")]
    ProofMalformed(usize),
    /// The proof folded to a digest other than the expected root.
    #[error("inclusion proof did not fold to the expected root")]
    ProofInvalid,
}

/// Compute leaf digests for an ordered receipt list, preserving order.
pub fn leaf_digests(receipts: &[Receipt]) -> Result<Vec<CompositeDigest>, MerkleError> {
    receipts
        .iter()
        .map(|r| r.leaf_digest().map_err(MerkleError::from))
        .collect()
}

/// Duplicate the last entry if `level` has odd length, then return it
/// paired-up into parent digests for the next level up.
fn pair_up(level: &[CompositeDigest]) -> Vec<CompositeDigest> {
    let mut padded = level.to_vec();
    if padded.len() % 2 == 1 {
        padded.push(padded.last().expect("level is nonempty").clone());
    }
    padded
        .chunks(2)
        .map(|pair| combine_digests(&pair[0], &pair[1]))
        .collect()
}

/// Build the Merkle root over already-computed leaf digests.
///
/// An empty leaf set roots to [`empty_sentinel_digest`]. Otherwise the
/// duplicate-last odd-fanout rule is applied level by level until one
/// digest remains.
pub fn merkle_root(leaves: &[CompositeDigest]) -> CompositeDigest {
    if leaves.is_empty() {
        return empty_sentinel_digest();
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = pair_up(&level);
    }
    level.into_iter().next().expect("loop exits with exactly one element")
}

/// Build the Merkle root over an ordered receipt list.
pub fn merkle_root_of_receipts(receipts: &[Receipt]) -> Result<CompositeDigest, MerkleError> {
    Ok(merkle_root(&leaf_digests(receipts)?))
}

/// Build an inclusion proof for the leaf at `index`, or `None` if out of range.
pub fn prove(leaves: &[CompositeDigest], index: usize) -> Option<InclusionProof> {
    if leaves.is_empty() || index >= leaves.len() {
        return None;
    }
    let mut steps = Vec::new();
    let mut level = leaves.to_vec();
    let mut i = index;
    while level.len() > 1 {
        let mut padded = level.clone();
        if padded.len() % 2 == 1 {
            padded.push(padded.last().expect("level is nonempty").clone());
        }
        let (sibling_index, side) = if i % 2 == 0 {
            (i + 1, Side::Right)
        } else {
            (i - 1, Side::Left)
        };
        steps.push(ProofStep {
            sibling: padded[sibling_index].clone(),
            side,
        });
        level = pair_up(&level);
        i /= 2;
    }
    Some(InclusionProof { steps })
}

/// Build an inclusion proof for the receipt at `index` in an ordered receipt list.
pub fn prove_receipt(
    receipts: &[Receipt],
    index: usize,
) -> Result<Option<InclusionProof>, MerkleError> {
    Ok(prove(&leaf_digests(receipts)?, index))
}

/// Validate a list of raw, possibly-malformed proof steps into a well-formed proof.
pub fn validate_proof(raw: Vec<RawProofStep>) -> Result<InclusionProof, MerkleError> {
    let mut steps = Vec::with_capacity(raw.len());
    for (i, step) in raw.into_iter().enumerate() {
        match (step.sibling, step.side) {
            (Some(sibling), Some(side)) => steps.push(ProofStep {
                sibling: CompositeDigest::from_raw(sibling),
                side,
            }),
            _ => return Err(MerkleError::ProofMalformed(i)),
        }
    }
    Ok(InclusionProof { steps })
}

/// Verify that `leaf` is included under `expected_root` according to `proof`.
pub fn verify(
    leaf: &CompositeDigest,
    proof: &InclusionProof,
    expected_root: &CompositeDigest,
) -> Result<bool, MerkleError> {
    if proof.steps.is_empty() {
        if leaf == expected_root {
            return Ok(true);
        }
        return Err(MerkleError::EmptyProofAgainstNonemptyRoot);
    }
    let mut current = leaf.clone();
    for step in &proof.steps {
        current = match step.side {
            Side::Right => combine_digests(&current, &step.sibling),
            Side::Left => combine_digests(&step.sibling, &current),
        };
    }
    Ok(&current == expected_root)
}

/// Verify a receipt's inclusion under `expected_root`.
pub fn verify_receipt(
    receipt: &Receipt,
    proof: &InclusionProof,
    expected_root: &CompositeDigest,
) -> Result<bool, MerkleError> {
    let leaf = receipt.leaf_digest()?;
    verify(&leaf, proof, expected_root)
}

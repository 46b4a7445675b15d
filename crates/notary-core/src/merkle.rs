//! Merkle tree implementation for batch anchoring
//!
//! Leaves and internal nodes are domain-separated so a leaf can never be
//! confused with an internal node:
//!
//! - leaf:     `SHA-256(0x00 || leaf bytes)`
//! - internal: `SHA-256(0x01 || left || right)`
//!
//! A level with an odd node count pairs its last node with itself. Proof
//! generation and [`verify_proof`] both follow that rule, so every proof has
//! exactly `depth` siblings.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Errors raised while building trees or parsing hashes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MerkleError {
    #[error("cannot build a Merkle tree from an empty batch")]
    Empty,

    #[error("leaf index {index} out of range for tree of {len} leaves")]
    IndexOutOfRange { index: u64, len: usize },

    #[error("invalid hash encoding: {0}")]
    InvalidHex(String),
}

/// A SHA-256 hash (32 bytes)
///
/// Serialized as lowercase hex so persisted receipts and API payloads stay
/// readable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Create a hash from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary data (no domain prefix)
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Hash leaf content with the leaf domain prefix
    pub fn leaf(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([LEAF_PREFIX]);
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Combine two hashes (for Merkle tree internal nodes)
    pub fn combine(left: &Hash, right: &Hash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([NODE_PREFIX]);
        hasher.update(left.0);
        hasher.update(right.0);
        Self(hasher.finalize().into())
    }

    /// Parse a 64 character hex string, with or without a `0x` prefix
    pub fn from_hex(s: &str) -> Result<Self, MerkleError> {
        let trimmed = s.trim();
        let raw = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if raw.len() != 64 {
            return Err(MerkleError::InvalidHex(format!(
                "expected 64 hex characters, got {}",
                raw.len()
            )));
        }
        let bytes = hex::decode(raw).map_err(|e| MerkleError::InvalidHex(e.to_string()))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Get hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hex with a `0x` prefix, as chains expect it
    pub fn to_prefixed_hex(&self) -> String {
        format!("0x{}", self.to_hex())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Constant-time equality
    pub fn ct_eq(&self, other: &Hash) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Hash> for String {
    fn from(hash: Hash) -> Self {
        hash.to_hex()
    }
}

impl TryFrom<String> for Hash {
    type Error = MerkleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Hash::from_hex(&value)
    }
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Leaf hash (already domain-separated)
    pub leaf: Hash,
    /// Position of the leaf in the batch
    pub index: u64,
    /// Sibling hashes, bottom-up
    pub proof: Vec<Hash>,
}

impl MerkleProof {
    /// Check this proof against a root
    pub fn verify(&self, root: &Hash) -> bool {
        verify_proof(&self.leaf, root, &self.proof, self.index)
    }
}

/// A Merkle tree over one anchoring batch
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] are the leaf hashes, the last level holds the root
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Build a tree from raw leaf content; each leaf is hashed with the leaf prefix
    pub fn from_leaves<T: AsRef<[u8]>>(leaves: &[T]) -> Result<Self, MerkleError> {
        let hashes = leaves.iter().map(|l| Hash::leaf(l.as_ref())).collect();
        Self::from_leaf_hashes(hashes)
    }

    /// Build a tree from leaf hashes that were computed earlier
    pub fn from_leaf_hashes(leaf_hashes: Vec<Hash>) -> Result<Self, MerkleError> {
        if leaf_hashes.is_empty() {
            return Err(MerkleError::Empty);
        }

        let mut levels = vec![leaf_hashes];
        loop {
            let current = &levels[levels.len() - 1];
            if current.len() == 1 {
                break;
            }
            let next: Vec<Hash> = current
                .chunks(2)
                .map(|pair| {
                    let left = &pair[0];
                    // Odd node count: pair the last node with itself
                    let right = pair.get(1).unwrap_or(left);
                    Hash::combine(left, right)
                })
                .collect();
            levels.push(next);
        }

        Ok(Self { levels })
    }

    /// Root hash
    pub fn root(&self) -> Hash {
        self.levels[self.levels.len() - 1][0]
    }

    /// Leaf hashes in batch order
    pub fn leaves(&self) -> &[Hash] {
        &self.levels[0]
    }

    /// Number of leaves
    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    /// Always false: empty trees cannot be built
    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    /// Number of sibling hashes in every proof
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Generate the inclusion proof for the leaf at `index`
    pub fn proof(&self, index: usize) -> Result<MerkleProof, MerkleError> {
        if index >= self.len() {
            return Err(MerkleError::IndexOutOfRange {
                index: index as u64,
                len: self.len(),
            });
        }

        let mut siblings = Vec::with_capacity(self.depth());
        let mut idx = index;
        for level in &self.levels[..self.depth()] {
            let sibling = level.get(idx ^ 1).unwrap_or(&level[idx]);
            siblings.push(*sibling);
            idx >>= 1;
        }

        Ok(MerkleProof {
            leaf: self.levels[0][index],
            index: index as u64,
            proof: siblings,
        })
    }

    /// Proofs for every leaf, in leaf order
    pub fn proofs(&self) -> Vec<MerkleProof> {
        (0..self.len())
            .filter_map(|i| self.proof(i).ok())
            .collect()
    }
}

/// Recompute the root from `(leaf, index, proof)` and compare it to `root`
///
/// Bit `i` of `index` selects the side at level `i`: 0 keeps the running hash
/// on the left. An index that does not fit in `proof.len()` bits is rejected.
pub fn verify_proof(leaf: &Hash, root: &Hash, proof: &[Hash], index: u64) -> bool {
    let depth = proof.len();
    if depth >= 64 {
        return false;
    }
    if index >> depth != 0 {
        return false;
    }

    let mut running = *leaf;
    let mut idx = index;
    for sibling in proof {
        running = if idx & 1 == 0 {
            Hash::combine(&running, sibling)
        } else {
            Hash::combine(sibling, &running)
        };
        idx >>= 1;
    }

    running.ct_eq(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaves(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("leaf-{i}").into_bytes()).collect()
    }

    #[test]
    fn test_hash_combine_is_order_sensitive() {
        let h1 = Hash::digest(b"hello");
        let h2 = Hash::digest(b"world");
        assert_eq!(Hash::combine(&h1, &h2), Hash::combine(&h1, &h2));
        assert_ne!(Hash::combine(&h1, &h2), Hash::combine(&h2, &h1));
    }

    #[test]
    fn test_leaf_and_node_domains_differ() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let mut concat = Vec::new();
        concat.extend_from_slice(&a.0);
        concat.extend_from_slice(&b.0);
        assert_ne!(Hash::leaf(&concat), Hash::combine(&a, &b));
    }

    #[test]
    fn test_single_leaf_tree() {
        let tree = MerkleTree::from_leaves(&[b"only".to_vec()]).unwrap();
        assert_eq!(tree.root(), Hash::leaf(b"only"));
        assert_eq!(tree.depth(), 0);

        let proof = tree.proof(0).unwrap();
        assert!(proof.proof.is_empty());
        assert!(verify_proof(&proof.leaf, &tree.root(), &proof.proof, 0));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let empty: Vec<Vec<u8>> = Vec::new();
        assert_eq!(MerkleTree::from_leaves(&empty).unwrap_err(), MerkleError::Empty);
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        let tree = MerkleTree::from_leaves(&leaves(3)).unwrap();
        let l = tree.leaves();
        let expected = Hash::combine(&Hash::combine(&l[0], &l[1]), &Hash::combine(&l[2], &l[2]));
        assert_eq!(tree.root(), expected);
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn test_proof_length_equals_depth() {
        for n in [2usize, 3, 4, 5, 8, 9, 17] {
            let tree = MerkleTree::from_leaves(&leaves(n)).unwrap();
            let expected_depth = (n as f64).log2().ceil() as usize;
            assert_eq!(tree.depth(), expected_depth, "n = {n}");
            for p in tree.proofs() {
                assert_eq!(p.proof.len(), expected_depth);
            }
        }
    }

    #[test]
    fn test_proof_from_other_tree_size_fails() {
        let small = MerkleTree::from_leaves(&leaves(4)).unwrap();
        let big = MerkleTree::from_leaves(&leaves(5)).unwrap();
        let proof = small.proof(1).unwrap();
        assert!(!proof.verify(&big.root()));
    }

    #[test]
    fn test_index_out_of_range() {
        let tree = MerkleTree::from_leaves(&leaves(2)).unwrap();
        assert!(tree.proof(2).is_err());

        let proof = tree.proof(0).unwrap();
        assert!(!verify_proof(&proof.leaf, &tree.root(), &proof.proof, 2));
    }

    #[test]
    fn test_swapped_index_fails() {
        let tree = MerkleTree::from_leaves(&leaves(4)).unwrap();
        let proof = tree.proof(0).unwrap();
        assert!(!verify_proof(&proof.leaf, &tree.root(), &proof.proof, 1));
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let h = Hash::digest(b"abc");
        assert_eq!(Hash::from_hex(&h.to_hex()).unwrap(), h);
        assert_eq!(Hash::from_hex(&h.to_prefixed_hex()).unwrap(), h);
        assert!(Hash::from_hex("abc").is_err());
        assert!(Hash::from_hex(&"zz".repeat(32)).is_err());

        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
    }

    proptest! {
        #[test]
        fn prop_every_leaf_verifies(n in 1usize..64) {
            let data = leaves(n);
            let tree = MerkleTree::from_leaves(&data).unwrap();
            let root = tree.root();
            for (i, item) in data.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                prop_assert_eq!(proof.leaf, Hash::leaf(item));
                prop_assert!(verify_proof(&proof.leaf, &root, &proof.proof, i as u64));
            }
        }

        #[test]
        fn prop_single_byte_mutation_fails(
            n in 2usize..33,
            pick in any::<prop::sample::Index>(),
            byte in 0usize..32,
            target in 0u8..3,
        ) {
            let tree = MerkleTree::from_leaves(&leaves(n)).unwrap();
            let i = pick.index(n);
            let proof = tree.proof(i).unwrap();
            let mut leaf = proof.leaf;
            let mut root = tree.root();
            let mut siblings = proof.proof.clone();

            match target {
                0 => leaf.0[byte] ^= 0x01,
                1 => root.0[byte] ^= 0x01,
                _ => {
                    let k = byte % siblings.len();
                    siblings[k].0[byte] ^= 0x01;
                }
            }

            prop_assert!(!verify_proof(&leaf, &root, &siblings, i as u64));
        }
    }
}

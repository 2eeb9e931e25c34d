//! Binary Merkle trees over tagged SHA-256 leaves.
//!
//! Used for the ciphertext hash tree (shared across all shares of an
//! upload) and for each share's own block hash tree. A tree with `n`
//! leaves is padded up to the next power of two by duplicating the last
//! leaf, matching the legacy share layout's fixed tree shape for a given
//! leaf count.

const TAG_INTERIOR: &[u8] = b"tahoe-grid-merkle-interior\x00";

use crate::digests::Sha256Digest;

/// A complete binary tree stored level-by-level, leaves first.
pub struct MerkleTree {
    /// `levels[0]` is the leaf level, `levels.last()` is the root (a
    /// single-element vec).
    levels: Vec<Vec<Sha256Digest>>,
}

impl MerkleTree {
    /// Build a tree over `leaves`. Panics if `leaves` is empty.
    pub fn new(leaves: Vec<Sha256Digest>) -> Self {
        assert!(!leaves.is_empty(), "merkle tree needs at least one leaf");

        let padded_len = leaves.len().next_power_of_two();
        let mut level = leaves;
        if let Some(&last) = level.last() {
            while level.len() < padded_len {
                level.push(last);
            }
        }

        let mut levels = vec![level];
        while levels.last().unwrap().len() > 1 {
            let prev = levels.last().unwrap();
            let mut next = Vec::with_capacity(prev.len() / 2);
            for pair in prev.chunks(2) {
                next.push(Sha256Digest::tagged_pair(TAG_INTERIOR, &pair[0], &pair[1]));
            }
            levels.push(next);
        }

        Self { levels }
    }

    pub fn root(&self) -> Sha256Digest {
        self.levels.last().unwrap()[0]
    }

    pub fn num_leaves(&self) -> usize {
        self.levels[0].len()
    }

    /// The sibling chain needed to verify `leaf_index` against the root:
    /// one hash per level, from the leaf's sibling up to (but not
    /// including) the root itself.
    pub fn sibling_chain(&self, leaf_index: usize) -> Vec<(usize, Sha256Digest)> {
        let mut chain = Vec::with_capacity(self.levels.len() - 1);
        let mut index = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = index ^ 1;
            chain.push((sibling_index, level[sibling_index]));
            index /= 2;
        }
        chain
    }

    /// Every hash in the tree, leaf level first and root last. This is
    /// the full-tree serialization written to a bucket for the
    /// ciphertext hash tree and each share's block hash tree.
    pub fn all_nodes(&self) -> Vec<Sha256Digest> {
        self.levels.iter().flatten().copied().collect()
    }
}

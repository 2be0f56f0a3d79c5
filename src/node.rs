//! Tree nodes: the inner-or-leaf shape, canonical blob framing, and the
//! node-hash computed over it.
//!
//! Node construction in this crate never passes through the "transient
//! empty" state the source allows (`SHAMapTreeNode` default-constructed
//! then finalized with `makeInner`/`setItem`): Rust's ownership model lets
//! [`Node::new_inner`] and [`Node::new_leaf`] simply return a fully formed
//! value, so there is nothing to observe in between.

use byteorder::{BigEndian, WriteBytesExt};
use sha2::{Digest, Sha512};
use std::sync::Arc;

use crate::item::{Item, LeafType};
use crate::tag::{NodeId, Tag};

const SHAPE_INNER: u8 = 0;

/// Sixteen child slots; an all-zero hash denotes an empty branch. Zero is
/// never a valid node hash for a populated tree (even an empty Inner's own
/// hash is computed over sixteen zero hashes, but that hash itself is
/// essentially never all-zero), so it doubles safely as the sentinel.
pub type Hash = [u8; 32];

pub const EMPTY_BRANCH: Hash = [0u8; 32];

#[derive(Clone, Debug)]
enum Body {
    Inner { children: Box<[Hash; 16]> },
    Leaf { item: Arc<Item>, leaf_type: LeafType },
}

/// A node of the tree: its address, the generation that created it, the
/// cached hash of its canonical serialization, and its inner-or-leaf body.
#[derive(Clone, Debug)]
pub struct Node {
    id: NodeId,
    seq: u64,
    hash: Hash,
    body: Body,
}

impl Node {
    /// An Inner node with all branches empty, at `id` stamped with `seq`.
    pub fn new_inner(id: NodeId, seq: u64) -> Self {
        let mut n = Node {
            id,
            seq,
            hash: EMPTY_BRANCH,
            body: Body::Inner {
                children: Box::new([EMPTY_BRANCH; 16]),
            },
        };
        n.recompute_hash();
        n
    }

    /// A Leaf node holding `item`, at `id` stamped with `seq`.
    pub fn new_leaf(id: NodeId, seq: u64, item: Arc<Item>, leaf_type: LeafType) -> Self {
        let mut n = Node {
            id,
            seq,
            hash: EMPTY_BRANCH,
            body: Body::Leaf { item, leaf_type },
        };
        n.recompute_hash();
        n
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Clones `self` with a new `seq`, for copy-on-write (§4.8). The
    /// returned node's cached hash is identical (content hasn't changed).
    pub fn cow_clone(&self, new_seq: u64) -> Self {
        let mut n = self.clone();
        n.seq = new_seq;
        n
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, Body::Leaf { .. })
    }

    pub fn is_inner(&self) -> bool {
        matches!(self.body, Body::Inner { .. })
    }

    pub fn get_node_hash(&self) -> Hash {
        self.hash
    }

    /// Converts this node into an Inner with all branches empty
    /// (§4.5 step 6, "convert N into an Inner"). Discards any leaf content.
    pub fn make_inner(&mut self) {
        self.body = Body::Inner {
            children: Box::new([EMPTY_BRANCH; 16]),
        };
        self.recompute_hash();
    }

    fn children(&self) -> &[Hash; 16] {
        match &self.body {
            Body::Inner { children } => children,
            Body::Leaf { .. } => panic!("children() called on a leaf node"),
        }
    }

    pub fn is_empty_branch(&self, i: u8) -> bool {
        self.children()[i as usize] == EMPTY_BRANCH
    }

    pub fn child_hash(&self, i: u8) -> Hash {
        self.children()[i as usize]
    }

    pub fn child_node_id(&self, i: u8) -> NodeId {
        self.id.child(i)
    }

    /// The branch this node would select for `tag`, i.e. `tag.nibble(depth)`.
    pub fn select_branch(&self, tag: &Tag) -> u8 {
        self.id.branch_for(tag)
    }

    /// Sets branch `i`'s child hash. Returns whether the cached node-hash
    /// changed as a result (used by `dirty_up` to detect a no-op, which is
    /// a structural bug per §4.9).
    pub fn set_child_hash(&mut self, i: u8, hash: Hash) -> bool {
        match &mut self.body {
            Body::Inner { children } => {
                if children[i as usize] == hash {
                    return false;
                }
                children[i as usize] = hash;
            }
            Body::Leaf { .. } => panic!("set_child_hash called on a leaf node"),
        }
        self.recompute_hash();
        true
    }

    /// Replaces this leaf's item (or turns an Inner into a Leaf holding
    /// it, for the pull-up collapse of §4.7). Returns whether the cached
    /// hash changed (the no-op update of P5 returns `false`).
    pub fn set_item(&mut self, item: Arc<Item>, leaf_type: LeafType) -> bool {
        let changed_content = match &self.body {
            Body::Leaf {
                item: old,
                leaf_type: old_type,
            } => !Arc::ptr_eq(old, &item) && (old.payload() != item.payload() || *old_type != leaf_type),
            Body::Inner { .. } => true,
        };
        self.body = Body::Leaf { item, leaf_type };
        if changed_content {
            self.recompute_hash();
            true
        } else {
            false
        }
    }

    pub fn peek_item(&self) -> Option<&Arc<Item>> {
        match &self.body {
            Body::Leaf { item, .. } => Some(item),
            Body::Inner { .. } => None,
        }
    }

    pub fn leaf_type(&self) -> Option<LeafType> {
        match &self.body {
            Body::Leaf { leaf_type, .. } => Some(*leaf_type),
            Body::Inner { .. } => None,
        }
    }

    /// Number of non-empty branches. Only meaningful for Inner nodes.
    pub fn branch_count(&self) -> usize {
        self.children().iter().filter(|h| **h != EMPTY_BRANCH).count()
    }

    /// The lowest-indexed non-empty branch, if any.
    pub fn lowest_branch(&self) -> Option<u8> {
        (0u8..16).find(|&i| !self.is_empty_branch(i))
    }

    /// The highest-indexed non-empty branch, if any. The source's
    /// `lastBelow` scans `for (i = 15; i >= 0; ++i)`, an acknowledged bug
    /// (`++` instead of `--`); this implements the evidently intended
    /// descending scan (see SPEC_FULL.md's Open Question resolution #1).
    pub fn highest_branch(&self) -> Option<u8> {
        (0u8..16).rev().find(|&i| !self.is_empty_branch(i))
    }

    /// Canonical prefix-framed serialization: the byte this node's
    /// `node_hash` is computed over. Shape byte, then either sixteen
    /// 256-bit child hashes (Inner) or `(leaf-type, tag, len, payload)`
    /// (Leaf).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.body {
            Body::Inner { children } => {
                out.push(SHAPE_INNER);
                for h in children.iter() {
                    out.extend_from_slice(h);
                }
            }
            Body::Leaf { item, leaf_type } => {
                out.push(leaf_type.tag_byte());
                out.extend_from_slice(item.tag().as_bytes());
                out.write_u32::<BigEndian>(item.payload().len() as u32)
                    .expect("writing to a Vec cannot fail");
                out.extend_from_slice(item.payload());
            }
        }
        out
    }

    fn recompute_hash(&mut self) {
        self.hash = node_hash_of_blob(&self.encode());
    }
}

/// `node_hash = first 256 bits of SHA-512(blob)` (§6).
pub fn node_hash_of_blob(blob: &[u8]) -> Hash {
    let digest = Sha512::digest(blob);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    out
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty blob")]
    Empty,
    #[error("unknown shape byte {0}")]
    UnknownShape(u8),
    #[error("truncated inner node blob")]
    TruncatedInner,
    #[error("truncated leaf node blob")]
    TruncatedLeaf,
}

/// Parses a blob produced by [`Node::encode`] back into a node at `id`,
/// stamped with `seq` (§4.11 step 4).
pub fn decode(id: NodeId, seq: u64, blob: &[u8]) -> Result<Node, DecodeError> {
    if blob.is_empty() {
        return Err(DecodeError::Empty);
    }
    let shape = blob[0];
    if shape == SHAPE_INNER {
        if blob.len() != 1 + 16 * 32 {
            return Err(DecodeError::TruncatedInner);
        }
        let mut children = Box::new([EMPTY_BRANCH; 16]);
        for i in 0..16 {
            let start = 1 + i * 32;
            children[i].copy_from_slice(&blob[start..start + 32]);
        }
        let mut n = Node {
            id,
            seq,
            hash: EMPTY_BRANCH,
            body: Body::Inner { children },
        };
        n.recompute_hash();
        Ok(n)
    } else if let Some(leaf_type) = LeafType::from_tag_byte(shape) {
        if blob.len() < 1 + 32 + 4 {
            return Err(DecodeError::TruncatedLeaf);
        }
        let mut tag_bytes = [0u8; 32];
        tag_bytes.copy_from_slice(&blob[1..33]);
        let len = u32::from_be_bytes(blob[33..37].try_into().unwrap()) as usize;
        if blob.len() != 37 + len {
            return Err(DecodeError::TruncatedLeaf);
        }
        let payload = blob[37..].to_vec();
        let item = Item::new(Tag::from_bytes(tag_bytes), payload);
        let mut n = Node {
            id,
            seq,
            hash: EMPTY_BRANCH,
            body: Body::Leaf { item, leaf_type },
        };
        n.recompute_hash();
        Ok(n)
    } else {
        Err(DecodeError::UnknownShape(shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_inner_round_trips() {
        let n = Node::new_inner(NodeId::ROOT, 0);
        let blob = n.encode();
        let back = decode(NodeId::ROOT, 0, &blob).unwrap();
        assert_eq!(back.get_node_hash(), n.get_node_hash());
        assert!(back.is_inner());
    }

    #[test]
    fn leaf_round_trips() {
        let item = Item::new(Tag::from_bytes([7u8; 32]), b"hello".to_vec());
        let n = Node::new_leaf(NodeId::ROOT, 3, item, LeafType::AccountState);
        let blob = n.encode();
        let back = decode(NodeId::ROOT, 3, &blob).unwrap();
        assert_eq!(back.get_node_hash(), n.get_node_hash());
        assert_eq!(back.peek_item().unwrap().payload(), b"hello");
    }

    #[test]
    fn set_child_hash_no_op_reports_unchanged() {
        let mut n = Node::new_inner(NodeId::ROOT, 0);
        assert!(n.set_child_hash(3, [9u8; 32]));
        assert!(!n.set_child_hash(3, [9u8; 32]));
    }

    #[test]
    fn identical_payload_update_is_a_no_op() {
        let item1 = Item::new(Tag::from_bytes([1u8; 32]), b"same".to_vec());
        let item2 = Item::new(Tag::from_bytes([1u8; 32]), b"same".to_vec());
        let id = NodeId::ROOT;
        let mut n = Node::new_leaf(id, 0, item1, LeafType::AccountState);
        let before = n.get_node_hash();
        assert!(!n.set_item(item2, LeafType::AccountState));
        assert_eq!(n.get_node_hash(), before);
    }
}

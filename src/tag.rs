//! 256-bit identifiers and the radix-16 positions derived from them.

use std::fmt;
use std::str::FromStr;

/// An immutable 256-bit lookup key.
///
/// `Tag` is attached to every [`Item`](crate::item::Item) and determines the
/// item's path through the tree: at depth `d` the branch taken is
/// `nibble(d)`, the half-byte at that position counting from the most
/// significant end.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag([u8; 32]);

/// Number of nibbles in a [`Tag`]; also the maximum depth of the tree.
pub const TAG_NIBBLES: u8 = 64;

impl Tag {
    pub const ZERO: Tag = Tag([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Tag(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The nibble (0..=15) of this tag at `depth` (0..64), counting from the
    /// most significant nibble of the first byte.
    pub fn nibble(&self, depth: u8) -> u8 {
        debug_assert!(depth < TAG_NIBBLES, "depth {depth} out of range");
        let byte = self.0[(depth / 2) as usize];
        if depth % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0f
        }
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", hex::encode(self.0))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Error returned when a [`Tag`] cannot be parsed from hex.
#[derive(Debug, thiserror::Error)]
pub enum TagParseError {
    #[error("expected 64 hex characters, got {0}")]
    WrongLength(usize),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl FromStr for Tag {
    type Err = TagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(TagParseError::WrongLength(s.len()));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Tag(out))
    }
}

/// A position in the radix-16 tree: the first `depth` nibbles of `prefix`
/// are significant, the remaining `64 - depth` nibbles MUST be zero.
///
/// The root is `NodeId { depth: 0, prefix: Tag::ZERO }`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId {
    depth: u8,
    prefix: Tag,
}

impl NodeId {
    pub const ROOT: NodeId = NodeId {
        depth: 0,
        prefix: Tag::ZERO,
    };

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn prefix(&self) -> Tag {
        self.prefix
    }

    /// The nibble a leaf node at this id must agree with `tag` on, for every
    /// position `0..depth`. Used by invariant checks and `select_branch`.
    pub fn branch_for(&self, tag: &Tag) -> u8 {
        tag.nibble(self.depth)
    }

    /// Whether `tag` matches this node's prefix for all `depth` nibbles
    /// (invariant 2 of the data model).
    pub fn agrees_with(&self, tag: &Tag) -> bool {
        (0..self.depth).all(|d| self.prefix.nibble(d) == tag.nibble(d))
    }

    /// The child id reached by taking `branch` (0..16) out of this node.
    pub fn child(&self, branch: u8) -> NodeId {
        debug_assert!(branch < 16);
        debug_assert!(self.depth < TAG_NIBBLES, "cannot descend past a leaf depth");
        let mut bytes = *self.prefix.as_bytes();
        let byte_idx = (self.depth / 2) as usize;
        if self.depth % 2 == 0 {
            bytes[byte_idx] = (bytes[byte_idx] & 0x0f) | (branch << 4);
        } else {
            bytes[byte_idx] = (bytes[byte_idx] & 0xf0) | branch;
        }
        NodeId {
            depth: self.depth + 1,
            prefix: Tag::from_bytes(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibble_extraction_matches_hex_order() {
        let tag: Tag = "092891fe4ef6cee585fdc6fda0e09eb4d386363158ec3321b8123e5a772c6cab"[..64]
            .parse()
            .unwrap();
        assert_eq!(tag.nibble(0), 0x0);
        assert_eq!(tag.nibble(1), 0x9);
        assert_eq!(tag.nibble(2), 0x2);
    }

    #[test]
    fn child_node_id_round_trips_branch() {
        let root = NodeId::ROOT;
        let a = root.child(0xa);
        assert_eq!(a.depth(), 1);
        assert_eq!(a.prefix().nibble(0), 0xa);
        let b = a.child(0x3);
        assert_eq!(b.depth(), 2);
        assert_eq!(b.prefix().nibble(0), 0xa);
        assert_eq!(b.prefix().nibble(1), 0x3);
    }

    #[test]
    fn branch_for_matches_tag_nibble() {
        let tag: Tag = "b92891fe4ef6cee585fdc6fda1e09eb4d386363158ec3321b8123e5a772c6ca8"
            .parse()
            .unwrap();
        let id = NodeId::ROOT.child(0xb).child(0x9);
        assert_eq!(id.branch_for(&tag), tag.nibble(2));
        assert!(id.agrees_with(&tag));
    }
}

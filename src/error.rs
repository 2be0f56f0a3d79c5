//! The three error kinds of §7: missing-node, logic violation, immutability.

use crate::tag::{NodeId, Tag};

/// Carries enough context to retry or escalate a partial-tree fault: which
/// slot was being materialized, what hash it was expected to resolve to,
/// and (if known) which key the caller was ultimately after.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingNodeError {
    pub node_id: NodeId,
    pub expected_hash: [u8; 32],
    pub target: Option<Tag>,
}

impl std::fmt::Display for MissingNodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "missing node at {:?} (expected hash {}){}",
            self.node_id,
            hex::encode(self.expected_hash),
            match self.target {
                Some(t) => format!(", while resolving {t}"),
                None => String::new(),
            }
        )
    }
}

impl std::error::Error for MissingNodeError {}

/// Top-level error for every public [`crate::map::SHAMap`] operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The tree is incomplete; the caller may retry after provisioning the
    /// missing node (e.g. fetching it over the network) or widen the fault
    /// into a hard failure.
    #[error(transparent)]
    MissingNode(#[from] MissingNodeError),

    /// An invariant was violated (duplicate insert, update of an absent
    /// key, a `set_child_hash` no-op mid `dirty_up`, ...). Fatal: per §7 the
    /// map is left unusable after this.
    #[error("logic violation: {0}")]
    Logic(String),

    /// A mutator was called on a map in the `IMMUTABLE` state. Fatal for
    /// this call only; the map remains usable read-only.
    #[error("map is immutable")]
    Immutable,
}

impl Error {
    pub(crate) fn logic(msg: impl Into<String>) -> Self {
        Error::Logic(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

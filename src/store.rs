//! The external object-store boundary (§6): fetch a node blob by its hash,
//! store a `(type_tag, seq, blob, hash)` record. The store's own
//! implementation is out of scope (spec.md §1 non-goals); this module only
//! defines the interface the map core calls through, plus an in-memory mock
//! for tests (mirroring `jmt`'s own `mocks` feature).

use std::fmt;

use crate::node::Hash;

/// Identifies which logical collection a flushed node belongs to (account
/// state tree vs. transaction tree, etc.) — opaque to the map core, passed
/// through to the store untouched.
pub type TypeTag = u32;

/// Anything that can go wrong talking to the backing store. Folded into
/// [`crate::error::Error::MissingNode`] by callers per §7 ("fetch failures
/// ... are all mapped to Missing-node").
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// External content-addressed object store adapter.
pub trait NodeStore: Send + Sync {
    /// Fetches the blob stored under `hash`, if any.
    fn retrieve(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError>;

    /// Persists `blob` (whose canonical hash is `hash`) tagged with
    /// `(type_tag, seq)`.
    fn store(&self, type_tag: TypeTag, seq: u64, blob: &[u8], hash: &Hash) -> Result<(), StoreError>;
}

/// An in-memory [`NodeStore`], for tests and examples. Not exposed as the
/// crate's production store — analogous to `jmt`'s `mocks` feature, which
/// exists purely so the tree's tests don't need a real backend.
#[cfg(feature = "mocks")]
pub struct InMemoryStore {
    blobs: parking_lot::Mutex<std::collections::HashMap<Hash, Vec<u8>>>,
}

#[cfg(feature = "mocks")]
impl Default for InMemoryStore {
    fn default() -> Self {
        InMemoryStore {
            blobs: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[cfg(feature = "mocks")]
impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(feature = "mocks")]
impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(feature = "mocks")]
impl NodeStore for InMemoryStore {
    fn retrieve(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.lock().get(hash).cloned())
    }

    fn store(&self, _type_tag: TypeTag, _seq: u64, blob: &[u8], hash: &Hash) -> Result<(), StoreError> {
        self.blobs.lock().insert(*hash, blob.to_vec());
        Ok(())
    }
}

//! An authenticated, copy-on-write, radix-16 hash tree.
//!
//! A [`map::SHAMap`] maps 256-bit [`tag::Tag`]s to opaque byte payloads and
//! reduces deterministically to a single 256-bit root hash. Mutation is
//! copy-on-write: taking a [`map::SHAMap::snapshot`] is O(1) and shares every
//! node with the original until one side diverges on it. Nodes are held in
//! an in-process cache and only escape to an external content-addressed
//! [`store::NodeStore`] when the caller explicitly arms and flushes the
//! dirty set.

pub mod error;
pub mod item;
pub mod map;
pub mod node;
pub mod store;
pub mod tag;

pub use error::{Error, MissingNodeError, Result};
pub use item::{Item, LeafType};
pub use map::{Config, MapState, SHAMap};
pub use node::Hash;
pub use store::{NodeStore, StoreError, TypeTag};
pub use tag::{NodeId, Tag};

#[cfg(feature = "mocks")]
pub use store::InMemoryStore;

//! B-tree primitives the catalog is written against.
//!
//! Node layout and page I/O live behind this trait. `insert` and `delete`
//! report `AlreadyExists` / `NotFound` distinctly from I/O failures.

pub mod memory;

use crate::catalog::records::{CatalogKey, CatalogRecord};
use crate::error::Result;

pub use memory::MemTree;

/// Node hint returned by searches, used to speed up the next access.
pub type NodeHint = u32;

pub trait CatalogTree: Send + Sync {
    fn search(&self, key: &CatalogKey, hint: NodeHint) -> Result<(CatalogRecord, NodeHint)>;

    fn insert(&self, key: &CatalogKey, record: CatalogRecord) -> Result<NodeHint>;

    fn delete(&self, key: &CatalogKey) -> Result<()>;

    /// Mutate the record at `key` in place.
    fn update(
        &self,
        key: &CatalogKey,
        hint: NodeHint,
        mutate: &mut dyn FnMut(&mut CatalogRecord) -> Result<()>,
    ) -> Result<NodeHint>;

    /// Visit records in key order starting at `start` (inclusive unless
    /// `after` is set) until the visitor returns `false`.
    fn iterate(
        &self,
        start: &CatalogKey,
        after: bool,
        visit: &mut dyn FnMut(&CatalogKey, &CatalogRecord, NodeHint) -> bool,
    ) -> Result<()>;

    /// Reserve node space for an upcoming insert/delete sequence.
    fn preflight(&self, _nodes: u32) -> Result<()> {
        Ok(())
    }

    fn postflight(&self) {}

    fn record_count(&self) -> usize;
}

/// Holds a `preflight` reservation until dropped.
pub struct Reservation<'a> {
    tree: &'a dyn CatalogTree,
}

impl<'a> Reservation<'a> {
    pub fn new(tree: &'a dyn CatalogTree, nodes: u32) -> Result<Self> {
        tree.preflight(nodes)?;
        Ok(Self { tree })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.tree.postflight();
    }
}

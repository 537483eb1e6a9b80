use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;
use tracing::debug;

use super::{CatalogTree, NodeHint};
use crate::catalog::records::{CatalogKey, CatalogRecord};
use crate::catalog::unicode::folded_units;
use crate::error::{CatalogError, Result};

/// Records per synthetic leaf node, used only to derive node hints.
const RECORDS_PER_NODE: u32 = 16;

/// Records copied out of the map per lock acquisition while iterating.
const ITERATE_BATCH: usize = 32;

/// Ordering key: parent id, then the name as the volume compares it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    parent_id: u32,
    name: Vec<u16>,
}

/// In-memory catalog B-tree.
pub struct MemTree {
    case_sensitive: bool,
    records: RwLock<BTreeMap<SortKey, (CatalogKey, CatalogRecord)>>,
}

impl MemTree {
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            case_sensitive,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_records(
        case_sensitive: bool,
        records: impl IntoIterator<Item = (CatalogKey, CatalogRecord)>,
    ) -> Self {
        let tree = Self::new(case_sensitive);
        {
            let mut map = tree.records.write();
            for (key, rec) in records {
                map.insert(tree.sort_key(&key), (key, rec));
            }
        }
        tree
    }

    /// Snapshot of every record in key order.
    pub fn records(&self) -> Vec<(CatalogKey, CatalogRecord)> {
        self.records.read().values().cloned().collect()
    }

    fn sort_key(&self, key: &CatalogKey) -> SortKey {
        let name = if self.case_sensitive {
            key.name.units().to_vec()
        } else {
            folded_units(key.name.units()).collect()
        };
        SortKey {
            parent_id: key.parent_id,
            name,
        }
    }

    fn hint_for(key: &CatalogKey) -> NodeHint {
        key.parent_id / RECORDS_PER_NODE + 1
    }
}

impl CatalogTree for MemTree {
    fn search(&self, key: &CatalogKey, _hint: NodeHint) -> Result<(CatalogRecord, NodeHint)> {
        let map = self.records.read();
        match map.get(&self.sort_key(key)) {
            Some((_, rec)) => Ok((rec.clone(), Self::hint_for(key))),
            None => Err(CatalogError::NotFound),
        }
    }

    fn insert(&self, key: &CatalogKey, record: CatalogRecord) -> Result<NodeHint> {
        let sort = self.sort_key(key);
        let mut map = self.records.write();
        if map.contains_key(&sort) {
            return Err(CatalogError::AlreadyExists);
        }
        debug!("btree insert parent={} name={:?}", key.parent_id, key.name);
        map.insert(sort, (key.clone(), record));
        Ok(Self::hint_for(key))
    }

    fn delete(&self, key: &CatalogKey) -> Result<()> {
        let mut map = self.records.write();
        match map.remove(&self.sort_key(key)) {
            Some(_) => {
                debug!("btree delete parent={} name={:?}", key.parent_id, key.name);
                Ok(())
            }
            None => Err(CatalogError::NotFound),
        }
    }

    fn update(
        &self,
        key: &CatalogKey,
        _hint: NodeHint,
        mutate: &mut dyn FnMut(&mut CatalogRecord) -> Result<()>,
    ) -> Result<NodeHint> {
        let mut map = self.records.write();
        let (_, rec) = map
            .get_mut(&self.sort_key(key))
            .ok_or(CatalogError::NotFound)?;
        // Mutate a copy so a failing mutator leaves the record untouched.
        let mut updated = rec.clone();
        mutate(&mut updated)?;
        *rec = updated;
        Ok(Self::hint_for(key))
    }

    fn iterate(
        &self,
        start: &CatalogKey,
        after: bool,
        visit: &mut dyn FnMut(&CatalogKey, &CatalogRecord, NodeHint) -> bool,
    ) -> Result<()> {
        let sort = self.sort_key(start);
        let mut lower = if after {
            Bound::Excluded(sort)
        } else {
            Bound::Included(sort)
        };
        // Copy out a batch at a time so visitors may call back into the tree.
        loop {
            let batch: Vec<(SortKey, CatalogKey, CatalogRecord)> = {
                let map = self.records.read();
                map.range((lower, Bound::Unbounded))
                    .take(ITERATE_BATCH)
                    .map(|(sort, (key, rec))| (sort.clone(), key.clone(), rec.clone()))
                    .collect()
            };
            let Some((last, _, _)) = batch.last() else {
                return Ok(());
            };
            lower = Bound::Excluded(last.clone());
            for (_, key, rec) in &batch {
                if !visit(key, rec, Self::hint_for(key)) {
                    return Ok(());
                }
            }
            if batch.len() < ITERATE_BATCH {
                return Ok(());
            }
        }
    }

    fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

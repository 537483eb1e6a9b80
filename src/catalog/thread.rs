//! Reverse lookup through thread records: CNID to (parent, name).

use super::codec::build_thread_key;
use super::records::*;
use super::Catalog;
use crate::btree::NodeHint;
use crate::error::{CatalogError, Result};

impl Catalog {
    /// Key of the namespace entry that owns `cnid`.
    pub fn getkey(&self, cnid: Cnid) -> Result<CatalogKey> {
        let (rec, _) = self.tree.search(&build_thread_key(cnid), 0)?;
        let CatalogRecord::Thread(thread) = rec else {
            self.vcb
                .mark_inconsistent(&format!("thread key of {} holds a leaf record", cnid));
            return Err(CatalogError::NotFound);
        };
        if thread.name.is_empty() {
            self.vcb
                .mark_inconsistent(&format!("thread record of {} has an empty name", cnid));
            return Err(CatalogError::NotFound);
        }
        Ok(CatalogKey {
            parent_id: thread.parent_id,
            name: thread.name,
        })
    }

    /// Find the leaf record for `cnid` through its thread record.
    ///
    /// System file ids other than the root are refused unless asked for.
    pub fn resolve_by_id(
        &self,
        cnid: Cnid,
        allow_system: bool,
    ) -> Result<(CatalogKey, CatalogRecord, NodeHint)> {
        if !allow_system && cnid < FIRST_USER_CNID && cnid != ROOT_FOLDER_ID {
            return Err(CatalogError::NotFound);
        }
        let key = self.getkey(cnid)?;
        let (rec, hint) = self.tree.search(&key, 0)?;
        Ok((key, rec, hint))
    }
}

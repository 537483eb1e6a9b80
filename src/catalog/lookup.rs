//! Name and id lookups with transparent hard-link resolution.

use tracing::{debug, warn};

use super::attr::{attr_from_record, CatAttr, CatDesc, CatFork};
use super::codec::{build_desc, build_key};
use super::mangle::{extract_mangled_cnid, mangle, needs_mangling};
use super::records::*;
use super::Catalog;
use crate::btree::NodeHint;
use crate::error::{CatalogError, Result};
use crate::volume::{DIR_HARDLINKS, FILE_HARDLINKS};

/// What a lookup found.
///
/// For a hard link `desc` describes the link record (its own CNID, parent and
/// name) while `attr` and `fork` come from the raw inode; `attr.linkref`
/// holds the inode id.
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub desc: CatDesc,
    pub attr: CatAttr,
    pub fork: Option<CatFork>,
    /// CNID of the leaf record that was found.
    pub cnid: Cnid,
}

impl LookupResult {
    pub fn is_hardlink(&self) -> bool {
        self.attr.linkref != 0
    }
}

impl Catalog {
    /// Inode id and kind when `file` is a hard link or directory alias
    /// stamped with this volume's hard-link epoch.
    pub(crate) fn link_target(&self, file: &FileRecord) -> Option<(Cnid, bool)> {
        let itime = to_bsd_time(file.dates.create);
        let file_epoch = self.vcb.private_dir(FILE_HARDLINKS).create_date;
        let dir_epoch = self.vcb.private_dir(DIR_HARDLINKS).create_date;
        let file_type = file.user_info.file_type();
        let creator = file.user_info.creator();

        if file_type == HARDLINK_FILE_TYPE && creator == HFSPLUS_CREATOR && itime == file_epoch {
            return Some((file.bsd.special, false));
        }
        if file_type == ALIAS_TYPE
            && creator == ALIAS_CREATOR
            && file.flags & REC_HAS_LINK_CHAIN != 0
            && itime == dir_epoch
        {
            return Some((file.bsd.special, true));
        }
        None
    }

    /// Turn the leaf record found at `key` into a lookup result, resolving
    /// hard links to their raw inode.
    pub(crate) fn result_from_record(
        &self,
        key: &CatalogKey,
        rec: CatalogRecord,
        hint: NodeHint,
        want_rsrc: bool,
    ) -> Result<LookupResult> {
        let cnid = rec.cnid();
        let mut encoding = 0;
        let mut isdir = rec.is_folder();
        let mut attr = attr_from_record(&rec).ok_or(CatalogError::NotFound)?;
        let mut fork = None;

        match &rec {
            CatalogRecord::Folder(dir) => encoding = dir.text_encoding,
            CatalogRecord::File(file) => {
                encoding = file.text_encoding;
                fork = Some(pick_fork(file, want_rsrc));
                if let Some((ilink, isdirlink)) = self.link_target(file) {
                    match self.resolve_link(ilink, isdirlink) {
                        Ok((inode, inode_attr)) => {
                            attr = inode_attr;
                            attr.linkref = ilink;
                            attr.recflags |= REC_HAS_LINK_CHAIN;
                            isdir = isdirlink;
                            fork = match &inode {
                                CatalogRecord::File(f) => Some(pick_fork(f, want_rsrc)),
                                _ => None,
                            };
                        }
                        Err(CatalogError::NotFound) => {
                            warn!("hard link {} points at missing inode {}", cnid, ilink);
                        }
                        Err(e) => return Err(e),
                    }
                } else if file.flags & REC_HAS_LINK_CHAIN != 0
                    && !self.vcb.is_private_dir(key.parent_id)
                {
                    // Link bits on a record that is neither link nor inode.
                    warn!("clearing stale hard-link bits on cnid {}", cnid);
                    attr.recflags &= !REC_HAS_LINK_CHAIN;
                    attr.firstlinkid = 0;
                    attr.linkcount = 1;
                }
            }
            CatalogRecord::Thread(_) => return Err(CatalogError::NotFound),
        }

        let desc = build_desc(key, cnid, hint, encoding, isdir)?;
        Ok(LookupResult {
            desc,
            attr,
            fork,
            cnid,
        })
    }

    fn lookup_by_key(
        &self,
        key: &CatalogKey,
        hint: NodeHint,
        want_rsrc: bool,
    ) -> Result<LookupResult> {
        let (rec, hint) = self.tree.search(key, hint)?;
        self.result_from_record(key, rec, hint, want_rsrc)
    }

    /// Look up `desc.name` under `desc.parent_cnid`, falling back to the
    /// mangled-name form when the literal name is not present.
    pub fn lookup_by_name(&self, desc: &CatDesc, want_rsrc: bool) -> Result<LookupResult> {
        let key = build_key(desc)?;
        match self.lookup_by_key(&key, desc.hint, want_rsrc) {
            Err(CatalogError::NotFound) => self.lookup_mangled(desc, want_rsrc),
            other => other,
        }
    }

    /// Reverse a mangled name: the embedded CNID must live under the same
    /// parent and re-mangle to exactly the caller's bytes.
    pub fn lookup_mangled(&self, desc: &CatDesc, want_rsrc: bool) -> Result<LookupResult> {
        let cnid = extract_mangled_cnid(&desc.name).ok_or(CatalogError::NotFound)?;
        if cnid < FIRST_USER_CNID {
            return Err(CatalogError::NotFound);
        }
        let found = self.lookup_by_id(cnid, false, want_rsrc)?;
        if found.desc.parent_cnid != desc.parent_cnid {
            return Err(CatalogError::NotFound);
        }
        if !needs_mangling(&found.desc.name) || mangle(&found.desc.name, cnid) != desc.name {
            debug!("mangled name {:?} is a false match for {}", desc.name, cnid);
            return Err(CatalogError::NotFound);
        }
        Ok(found)
    }

    /// Look up an entry by CNID through its thread record.
    pub fn lookup_by_id(
        &self,
        cnid: Cnid,
        allow_system: bool,
        want_rsrc: bool,
    ) -> Result<LookupResult> {
        let (key, rec, hint) = self.resolve_by_id(cnid, allow_system)?;
        if rec.is_thread() || rec.cnid() != cnid {
            self.vcb.mark_inconsistent(&format!(
                "thread of {} leads to record {}",
                cnid,
                rec.cnid()
            ));
            return Err(CatalogError::NotFound);
        }
        self.result_from_record(&key, rec, hint, want_rsrc)
    }
}

fn pick_fork(file: &FileRecord, want_rsrc: bool) -> CatFork {
    if want_rsrc {
        CatFork::from_fork_data(&file.rsrc_fork)
    } else {
        CatFork::from_fork_data(&file.data_fork)
    }
}

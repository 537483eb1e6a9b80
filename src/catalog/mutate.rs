//! Catalog mutations. Each is a short fixed sequence of B-tree calls with
//! explicit compensation when a later step fails.

use tracing::{debug, info, warn};

use super::attr::{CatAttr, CatDesc, CatFork, SF_IMMUTABLE, UF_IMMUTABLE};
use super::codec::{build_desc, build_key, build_thread, build_thread_key};
use super::records::*;
use super::Catalog;
use crate::error::{CatalogError, Result};
use crate::volume::VOL_CNIDS_REUSED;

/// A rename whose fallible phase has completed: the leaf record already sits
/// at its new key. Only `Catalog::commit_rename` may follow.
#[must_use = "a prepared rename leaves a stale thread record until committed"]
#[derive(Debug)]
pub struct PreparedRename {
    cnid: Cnid,
    isdir: bool,
    new_key: CatalogKey,
    desc: CatDesc,
    unchanged: bool,
}

impl PreparedRename {
    pub fn cnid(&self) -> Cnid {
        self.cnid
    }

    pub fn is_dir(&self) -> bool {
        self.isdir
    }
}

/// Result of the irrevocable half of a rename.
#[derive(Debug, Clone)]
pub struct RenameOutcome {
    pub desc: CatDesc,
    /// The thread record could not be rewritten and the volume was flagged.
    pub volume_flagged: bool,
}

/// Build the leaf record for a new entry.
fn build_record(attr: &CatAttr, cnid: Cnid, encoding: u32) -> CatalogRecord {
    let mut flags = REC_THREAD_EXISTS | REC_HAS_DATE_ADDED;
    if attr.flags & (UF_IMMUTABLE | SF_IMMUTABLE) != 0 {
        flags |= REC_FILE_LOCKED;
    }
    let bsd = BsdInfo {
        owner_id: attr.uid,
        group_id: attr.gid,
        admin_flags: (attr.flags >> 16) as u8,
        owner_flags: attr.flags as u8,
        file_mode: attr.mode,
        special: if attr.is_device() { attr.rdev } else { 0 },
    };
    let mut ext = attr.ext_info();
    ext.set_date_added(to_hfs_time(now_bsd()));

    if attr.is_dir() {
        CatalogRecord::Folder(FolderRecord {
            flags: flags | REC_HAS_FOLDER_COUNT,
            valence: 0,
            folder_id: cnid,
            dates: attr.to_dates(),
            bsd,
            user_info: attr.user_info(),
            finder_info: ext,
            text_encoding: encoding,
            folder_count: 0,
            first_link_id: 0,
        })
    } else {
        CatalogRecord::File(FileRecord {
            flags,
            file_id: cnid,
            dates: attr.to_dates(),
            bsd,
            user_info: attr.user_info(),
            finder_info: ext,
            text_encoding: encoding,
            ..Default::default()
        })
    }
}

impl Catalog {
    /// Create a namespace entry for `new_cnid`: thread record first, then
    /// the folder or file record.
    pub fn create(&self, new_cnid: Cnid, desc: &CatDesc, attr: &CatAttr) -> Result<CatDesc> {
        let key = build_key(desc)?;
        let isdir = attr.is_dir();
        let thread_key = build_thread_key(new_cnid);
        self.tree
            .insert(&thread_key, CatalogRecord::Thread(build_thread(&key, isdir)))?;

        let record = build_record(attr, new_cnid, desc.encoding);
        let hint = match self.tree.insert(&key, record) {
            Ok(hint) => hint,
            Err(e) => {
                self.undo_thread_insert(&thread_key);
                return Err(e);
            }
        };
        debug!("created {:?} in {} as {}", desc.name, desc.parent_cnid, new_cnid);
        build_desc(&key, new_cnid, hint, desc.encoding, isdir)
    }

    /// Remove an entry's leaf and thread records. A leftover thread record
    /// only flags the volume.
    pub fn delete(&self, desc: &CatDesc, attr: &CatAttr) -> Result<()> {
        let cnid = if desc.cnid != 0 { desc.cnid } else { attr.fileid };
        if cnid < FIRST_USER_CNID {
            return Err(CatalogError::InvalidArgument(format!(
                "refusing to delete system cnid {}",
                cnid
            )));
        }
        let key = build_key(desc)?;
        match self.tree.delete(&key) {
            Ok(()) => {}
            Err(CatalogError::NotFound) => {
                let found = self.lookup_mangled(desc, false)?;
                self.tree.delete(&build_key(&found.desc)?)?;
            }
            Err(e) => return Err(e),
        }
        if let Err(e) = self.tree.delete(&build_thread_key(cnid)) {
            warn!("could not delete thread record of {}: {}", cnid, e);
            self.vcb
                .mark_inconsistent(&format!("stale thread record for {}", cnid));
        }
        debug!("deleted {:?} from {} ({})", desc.name, desc.parent_cnid, cnid);
        Ok(())
    }

    /// Whether `ancestor` is `start` or lies on its path to the root.
    fn is_ancestor(&self, ancestor: Cnid, start: Cnid) -> Result<bool> {
        let mut current = start;
        for _ in 0..=self.tree.record_count() {
            if current == ancestor {
                return Ok(true);
            }
            if current <= ROOT_FOLDER_ID {
                return Ok(false);
            }
            current = self.getkey(current)?.parent_id;
        }
        Err(CatalogError::VolumeInconsistent(format!(
            "parent chain of {} does not reach the root",
            start
        )))
    }

    /// Refuse to move directory `cnid` out of `from_parent` into
    /// `dest_parent` when that would put it below itself.
    pub fn check_move(&self, cnid: Cnid, from_parent: Cnid, dest_parent: Cnid) -> Result<()> {
        if dest_parent != from_parent && self.is_ancestor(cnid, dest_parent)? {
            return Err(CatalogError::InvalidArgument(format!(
                "cannot move directory {} below itself",
                cnid
            )));
        }
        Ok(())
    }

    /// Fallible half of a rename: move the leaf record from `from` to `to`
    /// (inside `to_dir`). Every error leaves the catalog as it was.
    pub fn rename_prepare(
        &self,
        from: &CatDesc,
        to_dir: &CatDesc,
        to: &CatDesc,
    ) -> Result<PreparedRename> {
        let to_key = build_key(to)?;
        let mut from_key = build_key(from)?;
        let (rec, _) = match self.tree.search(&from_key, from.hint) {
            Ok(found) => found,
            Err(CatalogError::NotFound) => {
                let found = self.lookup_mangled(from, false)?;
                from_key = build_key(&found.desc)?;
                self.tree.search(&from_key, 0)?
            }
            Err(e) => return Err(e),
        };
        if rec.is_thread() {
            return Err(CatalogError::NotFound);
        }
        let cnid = rec.cnid();
        let isdir = rec.is_folder();
        let encoding = match &rec {
            CatalogRecord::Folder(dir) => dir.text_encoding,
            CatalogRecord::File(file) => file.text_encoding,
            CatalogRecord::Thread(_) => 0,
        };

        let dest_parent = if to_dir.cnid != 0 {
            to_dir.cnid
        } else {
            to.parent_cnid
        };
        if isdir {
            self.check_move(cnid, from_key.parent_id, dest_parent)?;
        }

        if from_key == to_key {
            debug!("rename of {} onto itself", cnid);
            return Ok(PreparedRename {
                cnid,
                isdir,
                desc: build_desc(&to_key, cnid, 0, encoding, isdir)?,
                new_key: to_key,
                unchanged: true,
            });
        }

        let hint = match self.tree.insert(&to_key, rec.clone()) {
            Ok(hint) => hint,
            Err(CatalogError::AlreadyExists) => {
                // Only a case variant of the source itself may be replaced.
                let (existing, _) = self.tree.search(&to_key, 0)?;
                if existing.cnid() != cnid || !existing.same_kind(&rec) {
                    return Err(CatalogError::AlreadyExists);
                }
                self.tree.delete(&from_key)?;
                match self.tree.insert(&to_key, rec.clone()) {
                    Ok(hint) => {
                        return Ok(PreparedRename {
                            cnid,
                            isdir,
                            desc: build_desc(&to_key, cnid, hint, encoding, isdir)?,
                            new_key: to_key,
                            unchanged: false,
                        });
                    }
                    Err(e) => {
                        if let Err(undo) = self.tree.insert(&from_key, rec) {
                            warn!("could not restore {} after failed rename: {}", cnid, undo);
                            self.vcb
                                .mark_inconsistent(&format!("lost leaf record of {}", cnid));
                        }
                        return Err(e);
                    }
                }
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.tree.delete(&from_key) {
            if let Err(undo) = self.tree.delete(&to_key) {
                warn!("could not remove new key of {} after failed rename: {}", cnid, undo);
                self.vcb
                    .mark_inconsistent(&format!("duplicate leaf records for {}", cnid));
            }
            return Err(e);
        }

        Ok(PreparedRename {
            cnid,
            isdir,
            desc: build_desc(&to_key, cnid, hint, encoding, isdir)?,
            new_key: to_key,
            unchanged: false,
        })
    }

    /// Irrevocable half of a rename: point the thread record at the new key.
    /// Failures here flag the volume instead of failing the rename.
    pub fn commit_rename(&self, prepared: PreparedRename) -> RenameOutcome {
        if prepared.unchanged {
            return RenameOutcome {
                desc: prepared.desc,
                volume_flagged: false,
            };
        }
        let thread_key = build_thread_key(prepared.cnid);
        let mut flagged = false;
        let mut replace = true;
        match self.tree.delete(&thread_key) {
            Ok(()) => {}
            Err(CatalogError::NotFound) => {
                warn!("thread record of {} missing during rename", prepared.cnid);
                flagged = true;
            }
            Err(e) => {
                warn!("could not remove old thread of {}: {}", prepared.cnid, e);
                flagged = true;
                replace = false;
            }
        }
        if replace {
            let thread = build_thread(&prepared.new_key, prepared.isdir);
            if let Err(e) = self.tree.insert(&thread_key, CatalogRecord::Thread(thread)) {
                warn!("could not insert new thread of {}: {}", prepared.cnid, e);
                flagged = true;
            }
        }
        if flagged {
            self.vcb
                .mark_inconsistent(&format!("thread record of {} not updated", prepared.cnid));
        }
        RenameOutcome {
            desc: prepared.desc,
            volume_flagged: flagged,
        }
    }

    pub fn rename(&self, from: &CatDesc, to_dir: &CatDesc, to: &CatDesc) -> Result<CatDesc> {
        let prepared = self.rename_prepare(from, to_dir, to)?;
        Ok(self.commit_rename(prepared).desc)
    }

    /// Write `attr` (and any given forks) back into the entry's record.
    pub fn update(
        &self,
        desc: &CatDesc,
        attr: &CatAttr,
        data_fork: Option<&CatFork>,
        rsrc_fork: Option<&CatFork>,
    ) -> Result<()> {
        let by_id = desc.cnid != attr.fileid
            || !desc.has_name()
            || attr.recflags & REC_HAS_LINK_CHAIN != 0;
        let key = if by_id {
            self.getkey(attr.fileid)?
        } else {
            build_key(desc)?
        };

        let config = &self.config;
        let locked = attr.flags & (UF_IMMUTABLE | SF_IMMUTABLE) != 0;
        let merge_bsd = |bsd: &mut BsdInfo| {
            if !(config.unknown_perms && attr.uid == config.unknown_uid) {
                bsd.owner_id = attr.uid;
            }
            if !(config.unknown_perms && attr.gid == config.unknown_gid) {
                bsd.group_id = attr.gid;
            }
            bsd.admin_flags = (attr.flags >> 16) as u8;
            bsd.owner_flags = attr.flags as u8;
            bsd.file_mode = attr.mode;
        };
        let merge_flags = |flags: u16| {
            let mut out = (flags & REC_THREAD_EXISTS) | (attr.recflags & !REC_FILE_LOCKED);
            if locked {
                out |= REC_FILE_LOCKED;
            }
            out
        };

        self.tree.update(&key, desc.hint, &mut |rec| match rec {
            CatalogRecord::Folder(dir) => {
                if dir.folder_id != attr.fileid {
                    return Err(CatalogError::NotFound);
                }
                merge_bsd(&mut dir.bsd);
                dir.flags = merge_flags(dir.flags);
                dir.dates = attr.to_dates();
                dir.user_info = attr.user_info();
                dir.finder_info = attr.ext_info();
                dir.valence = attr.entries;
                dir.folder_count = attr.dircount;
                dir.first_link_id = attr.firstlinkid;
                if dir.flags & REC_HAS_LINK_CHAIN != 0 {
                    dir.bsd.special = attr.linkcount;
                }
                Ok(())
            }
            CatalogRecord::File(file) => {
                if file.file_id != attr.fileid {
                    return Err(CatalogError::NotFound);
                }
                merge_bsd(&mut file.bsd);
                file.flags = merge_flags(file.flags);
                file.dates = attr.to_dates();
                file.user_info = attr.user_info();
                file.finder_info = attr.ext_info();
                file.first_link_id = attr.firstlinkid;
                if attr.is_device() {
                    file.bsd.special = attr.rdev;
                } else if file.flags & REC_HAS_LINK_CHAIN != 0 && attr.firstlinkid != 0 {
                    file.bsd.special = attr.linkcount;
                }
                if let Some(fork) = data_fork {
                    file.data_fork = fork.to_fork_data();
                }
                if let Some(fork) = rsrc_fork {
                    file.rsrc_fork = fork.to_fork_data();
                }
                Ok(())
            }
            CatalogRecord::Thread(_) => Err(CatalogError::NotFound),
        })?;
        Ok(())
    }

    /// Hand out the next unused CNID and hold it reserved until
    /// `release_cnid`. The id space wraps at most once per call.
    pub fn acquire_cnid(&self) -> Result<Cnid> {
        let ceiling = self.config.max_cnid.max(FIRST_USER_CNID + 1);
        let mut wrapped = false;
        loop {
            let (cnid, wrapped_now) = self.vcb.with_header(|h| {
                let cnid = h.next_catalog_id.max(FIRST_USER_CNID);
                if cnid >= ceiling {
                    h.next_catalog_id = FIRST_USER_CNID;
                    h.attributes |= VOL_CNIDS_REUSED;
                    (cnid, true)
                } else {
                    h.next_catalog_id = cnid + 1;
                    (cnid, false)
                }
            });
            if wrapped_now {
                if wrapped {
                    return Err(CatalogError::NoSpace);
                }
                wrapped = true;
                info!("catalog node ids wrapped, reusing freed ids");
                continue;
            }

            if self.reserved.contains(&cnid) || self.orphaned_attrs.contains(&cnid) {
                continue;
            }
            match self.tree.search(&build_thread_key(cnid), 0) {
                Ok(_) => continue,
                Err(CatalogError::NotFound) => {}
                Err(e) => return Err(e),
            }
            if self.vcb.cnids_reused() && self.cache.snoop(cnid, true, |_| ()).is_some() {
                debug!("cnid {} still has a cnode, skipping", cnid);
                continue;
            }
            if self.reserved.insert(cnid) {
                return Ok(cnid);
            }
        }
    }

    pub fn release_cnid(&self, cnid: Cnid) {
        self.reserved.remove(&cnid);
    }
}

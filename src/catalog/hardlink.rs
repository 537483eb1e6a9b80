//! Hard links: raw inodes under the private directories, link records that
//! point at them, and the prev/next sibling chain between links.

use tracing::{debug, warn};

use super::attr::{attr_from_record, CatAttr, CatDesc, S_IFMT, S_IFREG};
use super::codec::{build_desc, build_key, build_key_for, build_thread, build_thread_key};
use super::records::*;
use super::Catalog;
use crate::alloc::{ALLOC_CONTIGUOUS, ALLOC_FLUSH_JOURNAL};
use crate::error::{CatalogError, Result};
use crate::volume::{DIR_HARDLINKS, DIR_INODE_PREFIX, FILE_HARDLINKS, FILE_INODE_PREFIX};

/// Passed to `update_sibling_links` to leave a chain pointer as it is.
/// CNID 1 is the root's parent and never a link.
pub const IGNORE_LINK: Cnid = ROOT_PARENT_ID;

/// Size of the alias resource fork carried by a directory link.
pub const ALIAS_RSRC_SIZE: usize = 0x1d0;

const ALIAS_DATA_OFFSET: usize = 0x100;
const ALIAS_MAP_OFFSET: usize = 0x1a0;
const ALIAS_RECORD_OFFSET: usize = ALIAS_DATA_OFFSET + 4;
const ALIAS_VOL_CREATE_OFFSET: usize = 0x12a;
const ALIAS_PARENT_OFFSET: usize = 0x132;
const ALIAS_TARGET_OFFSET: usize = 0x176;

/// Synthetic name of a raw inode in its private directory.
pub fn inode_name(inode: Cnid, is_dir: bool) -> String {
    if is_dir {
        format!("{}{}", DIR_INODE_PREFIX, inode)
    } else {
        format!("{}{}", FILE_INODE_PREFIX, inode)
    }
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
}

/// Resource fork holding one 'alis' resource that describes a folder.
fn alias_template() -> Vec<u8> {
    let mut buf = vec![0u8; ALIAS_RSRC_SIZE];
    let data_len = ALIAS_MAP_OFFSET - ALIAS_DATA_OFFSET;
    let map_len = ALIAS_RSRC_SIZE - ALIAS_MAP_OFFSET;

    // Resource fork header, repeated at the start of the map.
    for base in [0, ALIAS_MAP_OFFSET] {
        put_u32(&mut buf, base, ALIAS_DATA_OFFSET as u32);
        put_u32(&mut buf, base + 4, ALIAS_MAP_OFFSET as u32);
        put_u32(&mut buf, base + 8, data_len as u32);
        put_u32(&mut buf, base + 12, map_len as u32);
    }

    // Alias record.
    let rec = ALIAS_RECORD_OFFSET;
    let rec_len = 0x96;
    put_u32(&mut buf, ALIAS_DATA_OFFSET, rec_len as u32);
    put_u16(&mut buf, rec + 4, rec_len);
    put_u16(&mut buf, rec + 6, 2); // version
    put_u16(&mut buf, rec + 8, 1); // kind: folder
    buf[0x12e..0x130].copy_from_slice(b"H+");
    put_u16(&mut buf, 0x186, 0xffff); // levels from
    put_u16(&mut buf, 0x188, 0xffff); // levels to
    put_u16(&mut buf, 0x19a, 0xffff); // end of extra data

    // Map: one type, one reference.
    let map = ALIAS_MAP_OFFSET;
    put_u16(&mut buf, map + 0x18, 0x1c); // type list offset
    put_u16(&mut buf, map + 0x1a, map_len as u16); // name list offset
    put_u16(&mut buf, map + 0x1c, 0); // types - 1
    buf[map + 0x1e..map + 0x22].copy_from_slice(b"alis");
    put_u16(&mut buf, map + 0x22, 0); // refs - 1
    put_u16(&mut buf, map + 0x24, 0x0a); // reference list offset
    put_u16(&mut buf, map + 0x26, 0); // resource id
    put_u16(&mut buf, map + 0x28, 0xffff); // no name
    buf
}

/// Alias fork for a directory link, with the volume create date, the
/// private directory id and the target inode patched in.
pub fn build_dir_alias(volume_create_date: u32, private_dir: Cnid, target: Cnid) -> Vec<u8> {
    let mut buf = alias_template();
    put_u32(&mut buf, ALIAS_VOL_CREATE_OFFSET, volume_create_date);
    put_u32(&mut buf, ALIAS_PARENT_OFFSET, private_dir);
    put_u32(&mut buf, ALIAS_TARGET_OFFSET, target);
    buf
}

impl Catalog {
    /// Allocate and write the alias fork of a new directory link.
    fn make_alias(&self, target: Cnid) -> Result<ForkData> {
        let block_size = self.alloc.block_size().max(1) as usize;
        let blocks = ALIAS_RSRC_SIZE.div_ceil(block_size) as u32;
        let (start, count) = match self.alloc.allocate(0, blocks, blocks, ALLOC_CONTIGUOUS) {
            Err(CatalogError::NoSpace) => self.alloc.allocate(
                0,
                blocks,
                blocks,
                ALLOC_CONTIGUOUS | ALLOC_FLUSH_JOURNAL,
            )?,
            other => other?,
        };
        let header = self.vcb.header();
        let private = self.vcb.private_dir(DIR_HARDLINKS).cnid;
        let alias = build_dir_alias(header.local_create_date, private, target);
        if let Err(e) = self.alloc.write_blocks(start, &alias) {
            self.free_blocks(start, count);
            return Err(e);
        }
        let mut fork = ForkData {
            logical_size: ALIAS_RSRC_SIZE as u64,
            clump_size: 0,
            total_blocks: count,
            extents: Default::default(),
        };
        fork.extents[0] = ExtentDescriptor {
            start_block: start,
            block_count: count,
        };
        Ok(fork)
    }

    fn free_blocks(&self, start: u32, count: u32) {
        if let Err(e) = self.alloc.deallocate(start, count) {
            warn!("could not free {} blocks at {}: {}", count, start, e);
            self.vcb.mark_inconsistent("leaked blocks");
        }
    }

    /// Free the resident extents of a fork.
    pub fn release_fork_blocks(&self, fork: &ForkData) {
        for ext in fork.extents.iter().filter(|e| e.block_count != 0) {
            self.free_blocks(ext.start_block, ext.block_count);
        }
    }

    /// Create a link record at `desc` pointing at the inode `attr.fileid`,
    /// with `next_link_id` as its successor in the sibling chain.
    pub fn create_link(&self, desc: &CatDesc, attr: &CatAttr, next_link_id: Cnid) -> Result<Cnid> {
        let isdirlink = desc.is_dir();
        let key = build_key(desc)?;
        let link_id = self.acquire_cnid()?;
        let result = self.insert_link(&key, link_id, attr, next_link_id, isdirlink);
        self.release_cnid(link_id);
        let link_id = result?;
        debug!(
            "created {} link {} -> inode {}",
            if isdirlink { "directory" } else { "file" },
            link_id,
            attr.fileid
        );
        Ok(link_id)
    }

    fn insert_link(
        &self,
        key: &CatalogKey,
        link_id: Cnid,
        attr: &CatAttr,
        next_link_id: Cnid,
        isdirlink: bool,
    ) -> Result<Cnid> {
        let thread_key = build_thread_key(link_id);
        self.tree
            .insert(&thread_key, CatalogRecord::Thread(build_thread(key, false)))?;

        let which = if isdirlink { DIR_HARDLINKS } else { FILE_HARDLINKS };
        let epoch = to_hfs_time(self.vcb.private_dir(which).create_date);
        let mut file = FileRecord {
            flags: REC_THREAD_EXISTS | REC_HAS_LINK_CHAIN,
            file_id: link_id,
            dates: CatalogDates {
                create: epoch,
                content_mod: epoch,
                attribute_mod: epoch,
                access: epoch,
                backup: 0,
            },
            bsd: BsdInfo {
                owner_id: attr.uid,
                group_id: attr.gid,
                file_mode: S_IFREG | (attr.mode & !S_IFMT),
                special: attr.fileid,
                ..Default::default()
            },
            text_encoding: attr.encoding,
            prev_link_id: 0,
            next_link_id,
            ..Default::default()
        };
        if isdirlink {
            file.user_info.set_type_creator(ALIAS_TYPE, ALIAS_CREATOR);
            file.user_info.set_finder_flags(FINDER_IS_ALIAS);
            match self.make_alias(attr.fileid) {
                Ok(fork) => file.rsrc_fork = fork,
                Err(e) => {
                    self.undo_thread_insert(&thread_key);
                    return Err(e);
                }
            }
        } else {
            file.user_info
                .set_type_creator(HARDLINK_FILE_TYPE, HFSPLUS_CREATOR);
        }

        let rsrc = file.rsrc_fork.clone();
        if let Err(e) = self.tree.insert(key, CatalogRecord::File(file)) {
            self.release_fork_blocks(&rsrc);
            self.undo_thread_insert(&thread_key);
            return Err(e);
        }
        Ok(link_id)
    }

    pub(crate) fn undo_thread_insert(&self, thread_key: &CatalogKey) {
        if let Err(e) = self.tree.delete(thread_key) {
            warn!(
                "could not remove thread record of {}: {}",
                thread_key.parent_id, e
            );
            self.vcb
                .mark_inconsistent("orphaned thread record after failed insert");
        }
    }

    /// Fetch the raw inode behind a link. The reported link count is at
    /// least 2.
    pub fn resolve_link(&self, link_ref: Cnid, is_dir_link: bool) -> Result<(CatalogRecord, CatAttr)> {
        let which = if is_dir_link { DIR_HARDLINKS } else { FILE_HARDLINKS };
        let private = self.vcb.private_dir(which).cnid;
        let key = build_key_for(private, &inode_name(link_ref, is_dir_link))?;
        let (rec, _) = self.tree.search(&key, 0)?;
        if rec.cnid() != link_ref {
            self.vcb
                .mark_inconsistent(&format!("inode record for {} holds {}", link_ref, rec.cnid()));
            return Err(CatalogError::NotFound);
        }
        let mut attr = attr_from_record(&rec).ok_or(CatalogError::NotFound)?;
        attr.linkcount = attr.linkcount.max(2);
        Ok((rec, attr))
    }

    /// Rewrite the chain pointers of one link. `IGNORE_LINK` leaves a
    /// pointer untouched.
    pub fn update_sibling_links(&self, link_id: Cnid, prev: Cnid, next: Cnid) -> Result<()> {
        let key = self.getkey(link_id)?;
        self.tree.update(&key, 0, &mut |rec| match rec {
            CatalogRecord::File(file)
                if file.file_id == link_id && file.flags & REC_HAS_LINK_CHAIN != 0 =>
            {
                if prev != IGNORE_LINK {
                    file.prev_link_id = prev;
                }
                if next != IGNORE_LINK {
                    file.next_link_id = next;
                }
                Ok(())
            }
            _ => Err(CatalogError::NotFound),
        })?;
        Ok(())
    }

    /// `(prev, next)` of a link record.
    pub fn lookup_sibling_links(&self, link_id: Cnid) -> Result<(Cnid, Cnid)> {
        let (_, rec, _) = self.resolve_by_id(link_id, false)?;
        match rec {
            CatalogRecord::File(file) if file.flags & REC_HAS_LINK_CHAIN != 0 => {
                Ok((file.prev_link_id, file.next_link_id))
            }
            _ => Err(CatalogError::NotFound),
        }
    }

    /// Follow `next` pointers from `seed` to the end of the chain.
    pub fn lookup_last_link(&self, seed: Cnid) -> Result<(Cnid, CatDesc)> {
        let mut link_id = seed;
        for _ in 0..HFS_LINK_MAX {
            let (key, rec, hint) = self.resolve_by_id(link_id, false)?;
            let CatalogRecord::File(file) = rec else {
                return Err(CatalogError::NotFound);
            };
            if file.next_link_id == 0 {
                let desc = build_desc(&key, link_id, hint, file.text_encoding, false)?;
                return Ok((link_id, desc));
            }
            link_id = file.next_link_id;
        }
        warn!("hard-link chain from {} does not terminate", seed);
        Err(CatalogError::TooManyLinks)
    }

    /// Remove a link record, freeing a directory link's alias fork first.
    pub fn delete_link(&self, desc: &CatDesc, attr: &CatAttr) -> Result<()> {
        let key = build_key(desc)?;
        if let Ok((CatalogRecord::File(file), _)) = self.tree.search(&key, desc.hint) {
            if file.user_info.file_type() == ALIAS_TYPE {
                self.release_fork_blocks(&file.rsrc_fork);
            }
        }
        self.delete(desc, attr)
    }

    /// Whether a directory link to `target` may be created in `start`.
    /// Any ancestor that is the target or itself a directory inode makes the
    /// link invalid, as does any failure walking up.
    pub fn check_link_ancestry(&self, start: Cnid, target: Cnid) -> bool {
        let mut parent = start;
        for _ in 0..HFS_LINK_MAX {
            if parent == ROOT_FOLDER_ID {
                return true;
            }
            if parent == target || parent < ROOT_FOLDER_ID {
                return false;
            }
            let (key, rec) = match self.resolve_by_id(parent, false) {
                Ok((key, rec, _)) => (key, rec),
                Err(e) => {
                    debug!("ancestry walk stopped at {}: {}", parent, e);
                    return false;
                }
            };
            match rec {
                CatalogRecord::Folder(dir) if dir.flags & REC_HAS_LINK_CHAIN == 0 => {}
                _ => return false,
            }
            parent = key.parent_id;
        }
        false
    }

    /// Mark every folder from `cnid` up to the root as having a directory
    /// hard link below it.
    pub fn set_child_link_bit(&self, cnid: Cnid) -> Result<()> {
        let mut current = cnid;
        for _ in 0..HFS_LINK_MAX {
            if current < ROOT_FOLDER_ID {
                return Ok(());
            }
            let key = self.getkey(current)?;
            let mut already_set = false;
            self.tree.update(&key, 0, &mut |rec| match rec {
                CatalogRecord::Folder(dir) => {
                    already_set = dir.flags & REC_HAS_CHILD_LINK != 0;
                    dir.flags |= REC_HAS_CHILD_LINK;
                    Ok(())
                }
                _ => Err(CatalogError::NotDirectory),
            })?;
            if already_set {
                return Ok(());
            }
            current = key.parent_id;
        }
        Err(CatalogError::TooManyLinks)
    }
}

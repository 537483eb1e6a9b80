//! Vnode-level operations over a mounted catalog.
//!
//! Every mutation follows the same order: cnode content locks first (through
//! `lock_set` and friends, sorted by fileid), then the catalog lock, then a
//! B-tree reservation. Lookups take the catalog lock shared and instantiate
//! cnodes through the cache without holding any content lock.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::alloc::BitmapAllocator;
use crate::btree::{CatalogTree, MemTree, Reservation};
use crate::catalog::attr::{CatAttr, CatDesc, CD_ISDIR, S_IFDIR, S_IFMT, S_IFREG, SF_IMMUTABLE, UF_IMMUTABLE};
use crate::catalog::codec::build_thread_key;
use crate::catalog::hardlink::inode_name;
use crate::catalog::readdir::cookie_index;
use crate::catalog::records::*;
use crate::catalog::unicode::encode_utf8_name;
use crate::catalog::{Catalog, EntriesOutcome, LookupResult, EOF_COOKIE, IGNORE_LINK};
use crate::cnode::lock::{lock_four, lock_pair, lock_set, LockMode, LockPolicy, LockedCnodes};
use crate::cnode::{
    Cnode, CnodeCache, CnodeHandle, ForkKind, GetOptions, C_DELETED, C_HARDLINK, C_MODIFIED,
    C_NOEXISTS,
};
use crate::config::CatalogConfig;
use crate::error::{CatalogError, Result};
use crate::state::reaper::start_reaper_thread;
use crate::volume::{Vcb, VolumeHeader, VolumeImage, DIR_HARDLINKS, FILE_HARDLINKS, TEMP_PREFIX};

/// B-tree nodes reserved ahead of each namespace change.
const PREFLIGHT_NODES: u32 = 8;

/// Attribute changes requested by `setattr`; `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub mode: Option<u16>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub flags: Option<u32>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

pub struct Mount {
    catalog: Catalog,
    alloc: Arc<BitmapAllocator>,
    /// The catalog B-tree lock: shared for lookups, exclusive for changes.
    catalog_lock: RwLock<()>,
}

impl Mount {
    pub fn new(
        tree: Arc<dyn CatalogTree>,
        alloc: Arc<BitmapAllocator>,
        header: VolumeHeader,
        config: CatalogConfig,
    ) -> Self {
        let cache = CnodeCache::new(config.max_dir_hints);
        let catalog = Catalog::new(tree, alloc.clone(), Vcb::new(header), config, cache);
        Self {
            catalog,
            alloc,
            catalog_lock: RwLock::new(()),
        }
    }

    /// Lay down an empty volume on the given collaborators.
    pub fn format_on(
        tree: Arc<dyn CatalogTree>,
        alloc: Arc<BitmapAllocator>,
        name: &str,
        config: CatalogConfig,
    ) -> Result<Self> {
        let mount = Self::new(tree, alloc, VolumeHeader::default(), config);
        mount.catalog.initialize(name)?;
        info!("formatted volume {:?}", name);
        Ok(mount)
    }

    /// An empty in-memory volume of `blocks` allocation blocks.
    pub fn format(name: &str, config: CatalogConfig, blocks: u32) -> Result<Self> {
        let tree = Arc::new(MemTree::new(config.case_sensitive));
        let alloc = Arc::new(BitmapAllocator::new(config.block_size, blocks));
        Self::format_on(tree, alloc, name, config)
    }

    /// Reopen a saved image. Entries left in the private directory by files
    /// that were removed while open are deleted now.
    pub fn open(image: VolumeImage) -> Result<Self> {
        let VolumeImage {
            header,
            config,
            records,
            allocator,
            orphaned_attrs,
        } = image;
        let tree = Arc::new(MemTree::from_records(config.case_sensitive, records));
        let alloc = Arc::new(BitmapAllocator::from_state(allocator));
        let mount = Self::new(tree, alloc, header, config);
        for cnid in orphaned_attrs {
            mount.catalog.add_orphaned_attrs(cnid);
        }
        let removed = mount.remove_temp_orphans()?;
        if removed > 0 {
            info!("removed {} orphaned open-unlinked files", removed);
        }
        Ok(mount)
    }

    pub fn to_image(&self) -> Result<VolumeImage> {
        let _cat = self.catalog_lock.read();
        Ok(VolumeImage {
            header: self.catalog.vcb().header(),
            config: self.catalog.config().clone(),
            records: self.catalog.snapshot()?,
            allocator: self.alloc.state(),
            orphaned_attrs: self.catalog.orphaned_attrs(),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cache(&self) -> &CnodeCache {
        self.catalog.cache()
    }

    pub fn allocator(&self) -> &BitmapAllocator {
        &self.alloc
    }

    /// Start the background thread that expires directory hints and evicts
    /// idle cnodes.
    pub fn start_reaper(&self, shutdown: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        let config = self.catalog.config();
        start_reaper_thread(
            self.cache().clone(),
            Duration::from_secs(config.reaper_interval_secs),
            Duration::from_secs(config.dir_hint_ttl_secs),
            shutdown,
        )
    }

    // Lookups

    /// Turn a catalog lookup into a referenced cnode.
    fn instantiate(&self, found: LookupResult, want_rsrc: bool) -> Result<CnodeHandle> {
        let opts = GetOptions {
            want_rsrc,
            skip_lock: true,
            allow_deleted: false,
        };
        let entry = match self.cache().get_or_create(found.attr.fileid, opts) {
            Ok(entry) => entry,
            // Removed while we were looking; the caller looks again.
            Err(CatalogError::NotFound) => return Err(CatalogError::RetryLookup),
            Err(e) => return Err(e),
        };
        let kind = if want_rsrc {
            ForkKind::Resource
        } else {
            ForkKind::Data
        };
        let is_link = found.is_hardlink();
        let cp = entry.handle;
        if entry.is_new {
            cp.set_attr(found.attr.clone());
            cp.set_desc(found.desc.clone());
            if !found.attr.is_dir() {
                if let Some(fork) = found.fork.clone() {
                    cp.attach_fork(kind, fork);
                }
            }
            self.cache().publish(&cp);
        } else if entry.is_attach {
            if let Some(fork) = found.fork.clone() {
                cp.attach_fork(kind, fork);
            }
            self.cache().publish(&cp);
        }
        if is_link {
            cp.set_flags(C_HARDLINK);
            cp.set_desc(found.desc);
        }
        Ok(cp)
    }

    fn is_reserved(&self, cnid: Cnid) -> bool {
        let vcb = self.catalog.vcb();
        vcb.is_private_dir(cnid) || vcb.is_journal_file(cnid)
    }

    pub fn root(&self) -> Result<CnodeHandle> {
        self.get_by_id(ROOT_FOLDER_ID)
    }

    /// Instantiate the entry `cnid` names, following a link id to its inode.
    pub fn get_by_id(&self, cnid: Cnid) -> Result<CnodeHandle> {
        debug!("get_by_id(cnid={})", cnid);
        let retries = self.catalog.config().lookup_retries;
        for _ in 0..=retries {
            let found = {
                let _cat = self.catalog_lock.read();
                self.catalog
                    .lookup_by_id(cnid, cnid == ROOT_FOLDER_ID, false)?
            };
            match self.instantiate(found, false) {
                Err(CatalogError::RetryLookup) => continue,
                other => return other,
            }
        }
        Err(CatalogError::NotFound)
    }

    pub fn lookup(&self, dir: &CnodeHandle, name: &str) -> Result<CnodeHandle> {
        debug!("lookup(dir={}, name={:?})", dir.fileid(), name);
        if !dir.is_dir() {
            return Err(CatalogError::NotDirectory);
        }
        match name {
            "" => return Err(CatalogError::InvalidName),
            "." => return Ok(dir.clone()),
            ".." => return self.parent_of(dir),
            _ => {}
        }

        let retries = self.catalog.config().lookup_retries;
        for attempt in 0..=retries {
            let found = {
                let _cat = self.catalog_lock.read();
                self.catalog
                    .lookup_by_name(&CatDesc::named(dir.fileid(), name), false)?
            };
            if dir.fileid() == ROOT_FOLDER_ID && self.is_reserved(found.cnid) {
                return Err(CatalogError::ReservedName);
            }
            let link_id = found.desc.cnid;
            let dir_link = found.is_hardlink() && found.attr.is_dir();
            match self.instantiate(found, false) {
                Ok(cp) => {
                    if dir_link {
                        cp.save_link_origin(dir.fileid(), link_id);
                    }
                    return Ok(cp);
                }
                Err(CatalogError::RetryLookup) => {
                    debug!("lookup of {:?} raced with a removal, attempt {}", name, attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Err(CatalogError::RetryLookup)
    }

    fn parent_of(&self, dir: &CnodeHandle) -> Result<CnodeHandle> {
        if dir.fileid() == ROOT_FOLDER_ID {
            return Ok(dir.clone());
        }
        // A directory reached through a link goes back the way it came.
        let parent = match dir.last_link_origin() {
            Some(origin) if dir.flags() & C_HARDLINK != 0 => origin.parent,
            _ => dir.desc().parent_cnid,
        };
        self.get_by_id(parent)
    }

    /// Resolve a slash-separated path from the root.
    pub fn lookup_path(&self, path: &str) -> Result<CnodeHandle> {
        let mut cur = self.root()?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            cur = self.lookup(&cur, component)?;
        }
        Ok(cur)
    }

    /// Resolve the directory part of `path` and return it with the last
    /// component.
    pub fn lookup_parent(&self, path: &str) -> Result<(CnodeHandle, String)> {
        let trimmed = path.trim_end_matches('/');
        let (dir, name) = match trimmed.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", trimmed),
        };
        if name.is_empty() {
            return Err(CatalogError::InvalidArgument(format!("no entry name in {:?}", path)));
        }
        Ok((self.lookup_path(dir)?, name.to_string()))
    }

    // Creation

    pub fn create(
        &self,
        dir: &CnodeHandle,
        name: &str,
        mode: u16,
        uid: u32,
        gid: u32,
    ) -> Result<CnodeHandle> {
        debug!("create(dir={}, name={:?}, mode={:#o})", dir.fileid(), name, mode);
        let mode = if mode & S_IFMT == 0 { S_IFREG | mode } else { mode };
        if mode & S_IFMT == S_IFDIR {
            return Err(CatalogError::InvalidArgument("create of a directory".into()));
        }
        self.make_entry(dir, name, mode, uid, gid)
    }

    pub fn mkdir(
        &self,
        dir: &CnodeHandle,
        name: &str,
        mode: u16,
        uid: u32,
        gid: u32,
    ) -> Result<CnodeHandle> {
        debug!("mkdir(dir={}, name={:?}, mode={:#o})", dir.fileid(), name, mode);
        self.make_entry(dir, name, S_IFDIR | (mode & !S_IFMT), uid, gid)
    }

    fn make_entry(
        &self,
        dir: &CnodeHandle,
        name: &str,
        mode: u16,
        uid: u32,
        gid: u32,
    ) -> Result<CnodeHandle> {
        if !dir.is_dir() {
            return Err(CatalogError::NotDirectory);
        }
        let _locks = lock_one(dir.arc(), LockMode::Exclusive)?;
        let _cat = self.catalog_lock.write();
        let _reserve = Reservation::new(self.catalog.tree(), PREFLIGHT_NODES)?;
        self.ensure_absent(dir.fileid(), name)?;

        let cnid = self.catalog.acquire_cnid()?;
        let created = self.create_locked(dir.fileid(), cnid, name, mode, uid, gid);
        self.catalog.release_cnid(cnid);
        self.instantiate(created?, false)
    }

    fn create_locked(
        &self,
        dir_cnid: Cnid,
        cnid: Cnid,
        name: &str,
        mode: u16,
        uid: u32,
        gid: u32,
    ) -> Result<LookupResult> {
        let mut attr = CatAttr::new_entry(mode, uid, gid);
        attr.fileid = cnid;
        let mut desc = CatDesc::named(dir_cnid, name);
        if attr.is_dir() {
            desc.flags |= CD_ISDIR;
        }
        self.catalog.create(cnid, &desc, &attr)?;
        self.adjust_valence(dir_cnid, attr.is_dir(), 1);
        self.catalog.vcb().adjust_counts(attr.is_dir(), 1);
        self.catalog.lookup_by_id(cnid, false, false)
    }

    /// `AlreadyExists` if `name` (or a mangled form of it) is taken.
    fn ensure_absent(&self, dir_cnid: Cnid, name: &str) -> Result<()> {
        match self.catalog.lookup_by_name(&CatDesc::named(dir_cnid, name), false) {
            Ok(_) => Err(CatalogError::AlreadyExists),
            Err(CatalogError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Add `delta` to a directory's valence (and folder count when the
    /// child is a directory) and stamp its times. Failure leaves the
    /// namespace change in place and flags the volume.
    fn adjust_valence(&self, dir_cnid: Cnid, child_is_dir: bool, delta: i32) {
        let result = self
            .catalog
            .lookup_by_id(dir_cnid, true, false)
            .and_then(|found| {
                let mut attr = found.attr;
                attr.entries = attr.entries.saturating_add_signed(delta);
                if child_is_dir {
                    attr.dircount = attr.dircount.saturating_add_signed(delta);
                }
                let now = now_bsd();
                attr.mtime = now;
                attr.ctime = now;
                self.catalog.update(&found.desc, &attr, None, None)?;
                self.cache().snoop(dir_cnid, false, |cp| {
                    cp.modify_attr(|cached| {
                        cached.entries = attr.entries;
                        cached.dircount = attr.dircount;
                        cached.mtime = now;
                        cached.ctime = now;
                    });
                    cp.clear_flags(C_MODIFIED);
                });
                Ok(())
            });
        if let Err(e) = result {
            warn!("could not update valence of {}: {}", dir_cnid, e);
            self.catalog
                .vcb()
                .mark_inconsistent(&format!("valence of {} out of date", dir_cnid));
        }
    }

    // Hard links

    /// Make `name` in `dir` another link to `target`.
    pub fn link(&self, target: &CnodeHandle, dir: &CnodeHandle, name: &str) -> Result<()> {
        debug!("link(target={}, dir={}, name={:?})", target.fileid(), dir.fileid(), name);
        if !dir.is_dir() {
            return Err(CatalogError::NotDirectory);
        }
        if target.fileid() == ROOT_FOLDER_ID || self.is_reserved(target.fileid()) {
            return Err(CatalogError::PermissionDenied);
        }
        let is_dir_link = target.is_dir();
        let _locks = lock_pair(dir.arc(), target.arc(), LockMode::Exclusive)?;
        let _cat = self.catalog_lock.write();
        let _reserve = Reservation::new(self.catalog.tree(), PREFLIGHT_NODES)?;

        let mut attr = target.attr();
        if attr.linkcount >= HFS_LINK_MAX {
            return Err(CatalogError::TooManyLinks);
        }
        self.ensure_absent(dir.fileid(), name)?;
        if is_dir_link {
            if target.desc().parent_cnid == dir.fileid()
                || !self.catalog.check_link_ancestry(dir.fileid(), target.fileid())
            {
                return Err(CatalogError::PermissionDenied);
            }
        }

        let mut link_desc = CatDesc::named(dir.fileid(), name);
        if is_dir_link {
            link_desc.flags |= CD_ISDIR;
        }
        if attr.recflags & REC_HAS_LINK_CHAIN != 0 {
            self.add_link(&link_desc, &mut attr)?;
        } else {
            self.convert_to_inode(target, &link_desc, &mut attr)?;
        }

        if is_dir_link {
            if let Err(e) = self.catalog.set_child_link_bit(dir.fileid()) {
                warn!("could not mark ancestors of {}: {}", dir.fileid(), e);
                self.catalog.vcb().mark_inconsistent("child link bit not set");
            }
        }
        attr.ctime = now_bsd();
        target.set_attr(attr);
        self.adjust_valence(dir.fileid(), is_dir_link, 1);
        self.catalog.vcb().adjust_counts(is_dir_link, 1);
        Ok(())
    }

    /// Prepend a link to an inode that already has a chain.
    fn add_link(&self, link_desc: &CatDesc, attr: &mut CatAttr) -> Result<()> {
        let first = attr.firstlinkid;
        let new_id = self.catalog.create_link(link_desc, attr, first)?;
        if first != 0 {
            if let Err(e) = self.catalog.update_sibling_links(first, new_id, IGNORE_LINK) {
                warn!("could not chain link {} ahead of {}: {}", new_id, first, e);
                self.catalog.vcb().mark_inconsistent("link chain broken");
            }
        }
        attr.linkcount += 1;
        attr.firstlinkid = new_id;
        self.write_inode(attr);
        Ok(())
    }

    /// First link to a plain entry: move it into the private directory as an
    /// inode and put link records at both the old and the new name.
    fn convert_to_inode(
        &self,
        target: &CnodeHandle,
        link_desc: &CatDesc,
        attr: &mut CatAttr,
    ) -> Result<()> {
        let is_dir = attr.is_dir();
        let which = if is_dir { DIR_HARDLINKS } else { FILE_HARDLINKS };
        let private = self.catalog.vcb().private_dir(which).cnid;
        if private == 0 {
            return Err(CatalogError::NotFound);
        }

        let orig = target.desc();
        let mut inode = CatDesc::named(private, &inode_name(attr.fileid, is_dir));
        if is_dir {
            inode.flags |= CD_ISDIR;
        }
        let moved = self
            .catalog
            .rename(&orig, &dir_desc(private), &inode)?;
        let undo_move = || {
            if let Err(e) = self.catalog.rename(&moved, &dir_desc(orig.parent_cnid), &orig) {
                warn!("could not move inode {} back: {}", attr.fileid, e);
                self.catalog.vcb().mark_inconsistent("inode stranded in private directory");
            }
        };

        let first = match self.catalog.create_link(&orig, attr, 0) {
            Ok(id) => id,
            Err(e) => {
                undo_move();
                return Err(e);
            }
        };
        let second = match self.catalog.create_link(link_desc, attr, first) {
            Ok(id) => id,
            Err(e) => {
                let mut first_desc = orig.clone();
                first_desc.cnid = first;
                if let Err(undo) = self.catalog.delete_link(&first_desc, attr) {
                    warn!("could not remove link {}: {}", first, undo);
                    self.catalog.vcb().mark_inconsistent("orphaned link record");
                }
                undo_move();
                return Err(e);
            }
        };
        if let Err(e) = self.catalog.update_sibling_links(first, second, IGNORE_LINK) {
            warn!("could not chain link {} ahead of {}: {}", second, first, e);
            self.catalog.vcb().mark_inconsistent("link chain broken");
        }

        attr.linkcount = 2;
        attr.recflags |= REC_HAS_LINK_CHAIN;
        attr.firstlinkid = second;
        attr.linkref = attr.fileid;
        self.write_inode(attr);

        let mut view = orig;
        view.cnid = first;
        target.set_desc(view);
        target.set_flags(C_HARDLINK);
        self.adjust_valence(private, is_dir, 1);
        debug!("cnid {} is now an inode with links {} and {}", attr.fileid, first, second);
        Ok(())
    }

    /// Persist inode attributes; the link records are already in place.
    fn write_inode(&self, attr: &CatAttr) {
        let desc = CatDesc {
            cnid: attr.fileid,
            ..Default::default()
        };
        if let Err(e) = self.catalog.update(&desc, attr, None, None) {
            warn!("could not update inode {}: {}", attr.fileid, e);
            self.catalog.vcb().mark_inconsistent("inode link count out of date");
        }
    }

    // Removal

    /// Remove a file or file hard link.
    pub fn remove(&self, dir: &CnodeHandle, name: &str) -> Result<()> {
        debug!("remove(dir={}, name={:?})", dir.fileid(), name);
        let cp = self.lookup(dir, name)?;
        if cp.is_dir() {
            return Err(CatalogError::IsDirectory);
        }
        let _locks = lock_pair(dir.arc(), cp.arc(), LockMode::Exclusive)?;
        let _cat = self.catalog_lock.write();
        let _reserve = Reservation::new(self.catalog.tree(), PREFLIGHT_NODES)?;
        self.remove_locked(dir, &cp, name)
    }

    /// Remove an empty directory or a directory hard link.
    pub fn rmdir(&self, dir: &CnodeHandle, name: &str) -> Result<()> {
        debug!("rmdir(dir={}, name={:?})", dir.fileid(), name);
        let cp = self.lookup(dir, name)?;
        if !cp.is_dir() {
            return Err(CatalogError::NotDirectory);
        }
        if cp.fileid() == dir.fileid() {
            return Err(CatalogError::InvalidArgument("cannot remove \".\"".into()));
        }
        let _locks = lock_pair(dir.arc(), cp.arc(), LockMode::Exclusive)?;
        let _cat = self.catalog_lock.write();
        let _reserve = Reservation::new(self.catalog.tree(), PREFLIGHT_NODES)?;
        self.remove_locked(dir, &cp, name)
    }

    /// Remove `name` from `dir`; both cnodes are locked and the catalog lock
    /// is held exclusive.
    fn remove_locked(&self, dir: &CnodeHandle, cp: &CnodeHandle, name: &str) -> Result<()> {
        let found = self
            .catalog
            .lookup_by_name(&CatDesc::named(dir.fileid(), name), false)?;
        if found.attr.fileid != cp.fileid() {
            return Err(CatalogError::RetryLookup);
        }
        if found.is_hardlink() {
            return self.unlink_link(dir, cp, &found);
        }

        if found.attr.is_dir() {
            if found.attr.entries > 0 {
                return Err(CatalogError::NotEmpty);
            }
            self.catalog.delete(&found.desc, &found.attr)?;
            cp.with_hints(|h| h.clear());
            cp.set_flags(C_NOEXISTS);
            self.adjust_valence(dir.fileid(), true, -1);
            self.catalog.vcb().adjust_counts(true, -1);
            return Ok(());
        }

        if cp.refs() > 1 {
            // Still open elsewhere: park it until the last reference goes.
            let private = self.catalog.vcb().private_dir(FILE_HARDLINKS).cnid;
            let temp = CatDesc::named(private, &format!("{}{}", TEMP_PREFIX, cp.fileid()));
            let moved = self.catalog.rename(&found.desc, &dir_desc(private), &temp)?;
            cp.set_desc(moved);
            cp.set_flags(C_DELETED);
            self.adjust_valence(private, false, 1);
            debug!("cnid {} is open, removal deferred", cp.fileid());
        } else {
            let forks = self.entry_forks(cp.fileid());
            self.catalog.delete(&found.desc, &found.attr)?;
            self.free_forks(&forks);
            cp.set_flags(C_NOEXISTS);
            self.catalog.vcb().adjust_counts(false, -1);
        }
        self.adjust_valence(dir.fileid(), false, -1);
        Ok(())
    }

    /// Remove one link of an inode, repairing the chain around it. The inode
    /// itself goes with its last link.
    fn unlink_link(&self, dir: &CnodeHandle, cp: &CnodeHandle, found: &LookupResult) -> Result<()> {
        let link_id = found.desc.cnid;
        let is_dir = found.attr.is_dir();
        let (prev, next) = self.catalog.lookup_sibling_links(link_id)?;
        let last = prev == 0 && next == 0;
        if last && is_dir && found.attr.entries > 0 {
            return Err(CatalogError::NotEmpty);
        }

        self.catalog.delete_link(&found.desc, &found.attr)?;
        if prev != 0 {
            if let Err(e) = self.catalog.update_sibling_links(prev, IGNORE_LINK, next) {
                warn!("could not repair link {}: {}", prev, e);
                self.catalog.vcb().mark_inconsistent("link chain broken");
            }
        }
        if next != 0 {
            if let Err(e) = self.catalog.update_sibling_links(next, prev, IGNORE_LINK) {
                warn!("could not repair link {}: {}", next, e);
                self.catalog.vcb().mark_inconsistent("link chain broken");
            }
        }
        cp.forget_link_origin(link_id);
        self.adjust_valence(dir.fileid(), is_dir, -1);
        self.catalog.vcb().adjust_counts(is_dir, -1);

        let mut attr = found.attr.clone();
        attr.linkcount = attr.linkcount.saturating_sub(1).max(1);
        if attr.firstlinkid == link_id {
            attr.firstlinkid = next;
        }
        attr.ctime = now_bsd();

        if !last {
            self.write_inode(&attr);
            if cp.desc().cnid == link_id {
                let survivor = if next != 0 { next } else { prev };
                match self.catalog.lookup_by_id(survivor, false, false) {
                    Ok(other) => cp.set_desc(other.desc),
                    Err(e) => debug!("no descriptor for link {}: {}", survivor, e),
                }
            }
            cp.set_attr(attr);
            return Ok(());
        }

        attr.firstlinkid = 0;
        cp.set_attr(attr);
        if cp.refs() > 1 {
            cp.set_flags(C_DELETED);
            debug!("inode {} is open, removal deferred", cp.fileid());
            return Ok(());
        }
        let which = if is_dir { DIR_HARDLINKS } else { FILE_HARDLINKS };
        let private = self.catalog.vcb().private_dir(which).cnid;
        let inode = self.catalog.lookup_by_id(cp.fileid(), false, false)?;
        let forks = self.entry_forks(cp.fileid());
        self.catalog.delete(&inode.desc, &inode.attr)?;
        self.free_forks(&forks);
        cp.set_flags(C_NOEXISTS);
        self.adjust_valence(private, is_dir, -1);
        Ok(())
    }

    /// Forks recorded on disk for a file, so their blocks can be freed once
    /// the record is gone.
    fn entry_forks(&self, cnid: Cnid) -> Vec<ForkData> {
        match self.catalog.resolve_by_id(cnid, false) {
            Ok((_, CatalogRecord::File(file), _)) => vec![file.data_fork, file.rsrc_fork],
            _ => Vec::new(),
        }
    }

    fn free_forks(&self, forks: &[ForkData]) {
        for fork in forks {
            self.catalog.release_fork_blocks(fork);
        }
    }

    /// Delete the record behind a reclaimed or leftover entry.
    fn reclaim_entry(&self, cnid: Cnid) -> Result<()> {
        let found = self.catalog.lookup_by_id(cnid, false, false)?;
        let forks = self.entry_forks(cnid);
        self.catalog.delete(&found.desc, &found.attr)?;
        self.free_forks(&forks);
        self.adjust_valence(found.desc.parent_cnid, found.attr.is_dir(), -1);
        // Links were counted off one by one; only parked files still count.
        if found.desc.name.starts_with(TEMP_PREFIX) {
            self.catalog.vcb().adjust_counts(found.attr.is_dir(), -1);
        }
        Ok(())
    }

    /// Delete entries whose removal was deferred until their last reference
    /// went away. Returns how many were reclaimed.
    pub fn reclaim_orphans(&self) -> Result<usize> {
        let victims = self.cache().take_reclaimable();
        if victims.is_empty() {
            return Ok(0);
        }
        let _cat = self.catalog_lock.write();
        let _reserve = Reservation::new(self.catalog.tree(), PREFLIGHT_NODES)?;
        let mut reclaimed = 0;
        for cp in victims {
            self.cache().mark_in_transit(&cp);
            let result = self.reclaim_entry(cp.fileid());
            cp.set_flags(C_NOEXISTS);
            if let Err(e) = self.cache().remove(&cp) {
                warn!("cnode {} still in use after reclaim: {}", cp.fileid(), e);
            }
            match result {
                Ok(()) => reclaimed += 1,
                Err(e) => {
                    warn!("could not reclaim cnid {}: {}", cp.fileid(), e);
                    self.catalog
                        .vcb()
                        .mark_inconsistent(&format!("cnid {} left orphaned", cp.fileid()));
                }
            }
        }
        debug!("reclaimed {} orphaned entries", reclaimed);
        Ok(reclaimed)
    }

    /// Remove "temp" entries left in the file private directory.
    fn remove_temp_orphans(&self) -> Result<usize> {
        let private = self.catalog.vcb().private_dir(FILE_HARDLINKS).cnid;
        if private == 0 {
            return Ok(0);
        }
        let mut temps = Vec::new();
        self.catalog
            .tree()
            .iterate(&build_thread_key(private), true, &mut |key, rec, _| {
                if key.parent_id != private {
                    return false;
                }
                if let Ok(name) = encode_utf8_name(&key.name) {
                    if name.starts_with(TEMP_PREFIX) && !rec.is_thread() {
                        temps.push(rec.cnid());
                    }
                }
                true
            })?;

        let _cat = self.catalog_lock.write();
        let mut removed = 0;
        for cnid in temps {
            match self.reclaim_entry(cnid) {
                Ok(()) => removed += 1,
                Err(e) => warn!("could not remove orphan {}: {}", cnid, e),
            }
        }
        Ok(removed)
    }

    // Rename

    pub fn rename(
        &self,
        fdir: &CnodeHandle,
        fname: &str,
        tdir: &CnodeHandle,
        tname: &str,
    ) -> Result<()> {
        debug!(
            "rename(fdir={}, fname={:?}, tdir={}, tname={:?})",
            fdir.fileid(),
            fname,
            tdir.fileid(),
            tname
        );
        if !tdir.is_dir() {
            return Err(CatalogError::NotDirectory);
        }
        let fcp = self.lookup(fdir, fname)?;
        let tcp = match self.lookup(tdir, tname) {
            Ok(cp) => Some(cp),
            Err(CatalogError::NotFound) => None,
            Err(e) => return Err(e),
        };
        let _locks = lock_four(
            fdir.arc(),
            fcp.arc(),
            Some(tdir.arc()),
            tcp.as_ref().map(|cp| cp.arc()),
            LockMode::Exclusive,
        )?;
        let _cat = self.catalog_lock.write();
        let _reserve = Reservation::new(self.catalog.tree(), PREFLIGHT_NODES)?;

        let from = self
            .catalog
            .lookup_by_name(&CatDesc::named(fdir.fileid(), fname), false)?;
        if from.attr.fileid != fcp.fileid() {
            return Err(CatalogError::RetryLookup);
        }
        let is_dir = from.attr.is_dir();

        let moves_dir = is_dir && fdir.fileid() != tdir.fileid();
        let carries_links =
            from.is_hardlink() || from.attr.recflags & REC_HAS_CHILD_LINK != 0;
        if moves_dir {
            self.catalog
                .check_move(from.desc.cnid, fdir.fileid(), tdir.fileid())?;
            if carries_links
                && !self.catalog.check_link_ancestry(tdir.fileid(), from.attr.fileid)
            {
                return Err(CatalogError::PermissionDenied);
            }
        }

        if let Some(tcp) = &tcp {
            let to = self
                .catalog
                .lookup_by_name(&CatDesc::named(tdir.fileid(), tname), false)?;
            if to.desc.cnid == from.desc.cnid {
                // Same record: only a change of case has anything to do.
                if to.desc.name == tname {
                    return Ok(());
                }
            } else if Arc::ptr_eq(tcp.arc(), fcp.arc()) {
                // Two links to the same inode.
                return Ok(());
            } else {
                match (is_dir, to.attr.is_dir()) {
                    (true, false) => return Err(CatalogError::NotDirectory),
                    (false, true) => return Err(CatalogError::IsDirectory),
                    _ => {}
                }
                self.remove_locked(tdir, tcp, tname)?;
            }
        }

        let mut to_desc = CatDesc::named(tdir.fileid(), tname);
        if from.desc.is_dir() {
            to_desc.flags |= CD_ISDIR;
        }
        let prepared = self
            .catalog
            .rename_prepare(&from.desc, &dir_desc(tdir.fileid()), &to_desc)?;
        let outcome = self.catalog.commit_rename(prepared);
        if outcome.volume_flagged {
            warn!("rename of {} left a stale thread record", from.desc.cnid);
        }

        if from.is_hardlink() {
            if fcp.desc().cnid == from.desc.cnid {
                fcp.set_desc(outcome.desc);
            }
            if is_dir {
                fcp.forget_link_origin(from.desc.cnid);
                fcp.save_link_origin(tdir.fileid(), from.desc.cnid);
            }
        } else {
            fcp.set_desc(outcome.desc);
        }
        fcp.modify_attr(|a| a.ctime = now_bsd());
        fcp.clear_flags(C_MODIFIED);

        if fdir.fileid() != tdir.fileid() {
            self.adjust_valence(fdir.fileid(), is_dir, -1);
            self.adjust_valence(tdir.fileid(), is_dir, 1);
        }
        if moves_dir && carries_links {
            if let Err(e) = self.catalog.set_child_link_bit(tdir.fileid()) {
                warn!("could not mark {} as holding links: {}", tdir.fileid(), e);
            }
        }
        Ok(())
    }

    // Attributes and enumeration

    pub fn setattr(&self, cp: &CnodeHandle, changes: &SetAttr) -> Result<()> {
        debug!("setattr(cnid={}, changes={:?})", cp.fileid(), changes);
        let _locks = lock_one(cp.arc(), LockMode::Exclusive)?;
        let _cat = self.catalog_lock.write();

        let mut attr = cp.attr();
        let immutable = attr.flags & (UF_IMMUTABLE | SF_IMMUTABLE) != 0;
        let other_changes = changes.mode.is_some()
            || changes.uid.is_some()
            || changes.gid.is_some()
            || changes.atime.is_some()
            || changes.mtime.is_some();
        if immutable && other_changes {
            return Err(CatalogError::PermissionDenied);
        }

        if let Some(mode) = changes.mode {
            attr.mode = (attr.mode & S_IFMT) | (mode & !S_IFMT);
        }
        if let Some(uid) = changes.uid {
            attr.uid = uid;
        }
        if let Some(gid) = changes.gid {
            attr.gid = gid;
        }
        if let Some(flags) = changes.flags {
            attr.flags = flags;
        }
        if let Some(atime) = changes.atime {
            attr.atime = atime;
            attr.atimeondisk = atime;
        }
        if let Some(mtime) = changes.mtime {
            attr.mtime = mtime;
        }
        attr.ctime = now_bsd();

        let data = cp.fork(ForkKind::Data);
        let rsrc = cp.fork(ForkKind::Resource);
        self.catalog
            .update(&cp.desc(), &attr, data.as_ref(), rsrc.as_ref())?;
        cp.set_attr(attr);
        cp.clear_flags(C_MODIFIED);
        Ok(())
    }

    /// Pack entries of `dir` into `buf`, resuming at `cookie` (0 to start).
    pub fn readdir(&self, dir: &CnodeHandle, cookie: u64, buf: &mut [u8]) -> Result<EntriesOutcome> {
        debug!("readdir(dir={}, cookie={:#x}, len={})", dir.fileid(), cookie, buf.len());
        if !dir.is_dir() {
            return Err(CatalogError::NotDirectory);
        }
        if cookie == EOF_COOKIE {
            return Ok(EntriesOutcome {
                eof: true,
                ..Default::default()
            });
        }
        let _locks = lock_set(&[dir.arc()], LockMode::Shared, LockPolicy::Default)?;
        let mut hint = dir.with_hints(|h| h.take(cookie_index(cookie)));
        let outcome = {
            let _cat = self.catalog_lock.read();
            self.catalog.get_entries(dir.fileid(), &mut hint, buf)?
        };
        if !outcome.eof {
            dir.with_hints(|h| h.put(hint));
        }
        Ok(outcome)
    }
}

fn lock_one(cp: &Arc<Cnode>, mode: LockMode) -> Result<LockedCnodes> {
    Ok(lock_set(&[cp], mode, LockPolicy::Default)?)
}

/// Descriptor naming only a destination directory.
fn dir_desc(cnid: Cnid) -> CatDesc {
    CatDesc {
        cnid,
        flags: CD_ISDIR,
        ..Default::default()
    }
}

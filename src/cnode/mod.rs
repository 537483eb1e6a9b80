//! In-memory catalog nodes.
//!
//! A cnode backs both file handles (data and resource fork) of one catalog
//! entry. Hard links share the cnode of their raw inode.

pub mod cache;
pub mod dirhint;
pub mod lock;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use self::dirhint::DirHintList;
use self::lock::{ContentLock, LockMode, LockPolicy, TruncateGuard, TruncateLock};
use crate::catalog::attr::{CatAttr, CatDesc, CatFork};
use crate::catalog::records::Cnid;
use crate::error::{CatalogError, Result};

pub use cache::{CacheEntry, CnodeCache, CnodeHandle, GetOptions};

// Cnode flags.
pub const C_MODIFIED: u32 = 0x0001;
/// Catalog entry is gone; the cnode only lingers until its last reference.
pub const C_NOEXISTS: u32 = 0x0002;
/// Unlinked while still referenced.
pub const C_DELETED: u32 = 0x0004;
pub const C_HARDLINK: u32 = 0x0008;
pub const C_NEED_DATA_RELEASE: u32 = 0x0010;
pub const C_NEED_RSRC_RELEASE: u32 = 0x0020;

// Hash states, changed only under the cache table mutex.
pub const H_ALLOC: u32 = 0x01;
pub const H_ATTACH: u32 = 0x02;
pub const H_TRANSIT: u32 = 0x04;
pub const H_WAITING: u32 = 0x08;

const MAX_LINK_ORIGINS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkKind {
    Data,
    Resource,
}

impl ForkKind {
    pub fn other(self) -> Self {
        match self {
            ForkKind::Data => ForkKind::Resource,
            ForkKind::Resource => ForkKind::Data,
        }
    }
}

/// Parent directory through which a directory hard link was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOrigin {
    pub parent: Cnid,
    pub link_id: Cnid,
}

#[derive(Debug, Default)]
struct Forks {
    data: Option<CatFork>,
    rsrc: Option<CatFork>,
}

impl Forks {
    fn slot(&mut self, kind: ForkKind) -> &mut Option<CatFork> {
        match kind {
            ForkKind::Data => &mut self.data,
            ForkKind::Resource => &mut self.rsrc,
        }
    }
}

pub struct Cnode {
    fileid: Cnid,
    hflags: AtomicU32,
    refs: AtomicU32,
    flags: AtomicU32,
    desc: RwLock<CatDesc>,
    attr: RwLock<CatAttr>,
    forks: Mutex<Forks>,
    lock: ContentLock,
    truncate: TruncateLock,
    hints: Mutex<DirHintList>,
    origins: Mutex<VecDeque<LinkOrigin>>,
}

impl std::fmt::Debug for Cnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cnode")
            .field("fileid", &self.fileid)
            .field("flags", &self.flags())
            .field("hflags", &self.hflags())
            .field("refs", &self.refs())
            .finish()
    }
}

impl Cnode {
    pub fn new(fileid: Cnid, max_dir_hints: usize) -> Self {
        Self {
            fileid,
            hflags: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            desc: RwLock::new(CatDesc::default()),
            attr: RwLock::new(CatAttr {
                fileid,
                ..Default::default()
            }),
            forks: Mutex::new(Forks::default()),
            lock: ContentLock::for_fileid(fileid),
            truncate: TruncateLock::default(),
            hints: Mutex::new(DirHintList::new(max_dir_hints)),
            origins: Mutex::new(VecDeque::new()),
        }
    }

    pub fn fileid(&self) -> Cnid {
        self.fileid
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn is_deleted(&self) -> bool {
        self.flags() & (C_DELETED | C_NOEXISTS) != 0
    }

    pub(crate) fn hflags(&self) -> u32 {
        self.hflags.load(Ordering::Acquire)
    }

    pub(crate) fn set_hflags(&self, bits: u32) {
        self.hflags.fetch_or(bits, Ordering::AcqRel);
    }

    pub(crate) fn clear_hflags(&self, bits: u32) {
        self.hflags.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Open/lookup references currently held through handles.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn desc(&self) -> CatDesc {
        self.desc.read().clone()
    }

    pub fn set_desc(&self, desc: CatDesc) {
        *self.desc.write() = desc;
    }

    pub fn attr(&self) -> CatAttr {
        self.attr.read().clone()
    }

    pub fn set_attr(&self, attr: CatAttr) {
        *self.attr.write() = attr;
    }

    /// Apply a change to the cached attributes and mark the cnode dirty.
    pub fn modify_attr(&self, f: impl FnOnce(&mut CatAttr)) {
        f(&mut self.attr.write());
        self.set_flags(C_MODIFIED);
    }

    pub fn is_dir(&self) -> bool {
        self.attr.read().is_dir()
    }

    // Forks

    pub fn has_fork(&self, kind: ForkKind) -> bool {
        self.forks.lock().slot(kind).is_some()
    }

    pub fn has_any_fork(&self) -> bool {
        let forks = self.forks.lock();
        forks.data.is_some() || forks.rsrc.is_some()
    }

    pub fn fork(&self, kind: ForkKind) -> Option<CatFork> {
        self.forks.lock().slot(kind).clone()
    }

    pub fn attach_fork(&self, kind: ForkKind, fork: CatFork) {
        *self.forks.lock().slot(kind) = Some(fork);
    }

    pub fn update_fork(&self, kind: ForkKind, f: impl FnOnce(&mut CatFork)) -> bool {
        match self.forks.lock().slot(kind) {
            Some(fork) => {
                f(fork);
                self.set_flags(C_MODIFIED);
                true
            }
            None => false,
        }
    }

    pub fn detach_fork(&self, kind: ForkKind) -> Option<CatFork> {
        self.forks.lock().slot(kind).take()
    }

    pub(crate) fn detach_all_forks(&self) {
        let mut forks = self.forks.lock();
        forks.data = None;
        forks.rsrc = None;
    }

    /// Release a fork once the outermost truncate lock is dropped.
    pub fn defer_fork_release(&self, kind: ForkKind) {
        self.set_flags(match kind {
            ForkKind::Data => C_NEED_DATA_RELEASE,
            ForkKind::Resource => C_NEED_RSRC_RELEASE,
        });
    }

    pub(crate) fn flush_deferred_releases(&self) {
        let pending = self.flags.fetch_and(
            !(C_NEED_DATA_RELEASE | C_NEED_RSRC_RELEASE),
            Ordering::AcqRel,
        );
        if pending & C_NEED_DATA_RELEASE != 0 {
            self.detach_fork(ForkKind::Data);
        }
        if pending & C_NEED_RSRC_RELEASE != 0 {
            self.detach_fork(ForkKind::Resource);
        }
    }

    // Locks

    pub fn content_lock(&self) -> &ContentLock {
        &self.lock
    }

    pub fn truncate_lock(&self) -> &TruncateLock {
        &self.truncate
    }

    /// Take the content lock. Under `LockPolicy::Default` a cnode whose
    /// catalog entry is gone is refused.
    pub fn lock(&self, mode: LockMode, policy: LockPolicy) -> Result<()> {
        self.lock.lock(mode, self.fileid);
        if policy == LockPolicy::Default && self.flags() & C_NOEXISTS != 0 {
            self.lock.unlock();
            return Err(CatalogError::NotFound);
        }
        Ok(())
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    pub fn lock_truncate(&self, mode: LockMode, skip_if_exclusive: bool) -> TruncateGuard<'_> {
        let acquired = self.truncate.lock(mode, skip_if_exclusive);
        TruncateGuard::new(self, acquired)
    }

    // Directory hints

    pub fn with_hints<R>(&self, f: impl FnOnce(&mut DirHintList) -> R) -> R {
        f(&mut self.hints.lock())
    }

    // Hard-link origins

    pub fn save_link_origin(&self, parent: Cnid, link_id: Cnid) {
        let mut origins = self.origins.lock();
        origins.retain(|o| o.parent != parent);
        origins.push_front(LinkOrigin { parent, link_id });
        origins.truncate(MAX_LINK_ORIGINS);
    }

    pub fn link_origin(&self, parent: Cnid) -> Option<Cnid> {
        self.origins
            .lock()
            .iter()
            .find(|o| o.parent == parent)
            .map(|o| o.link_id)
    }

    pub fn forget_link_origin(&self, link_id: Cnid) {
        self.origins.lock().retain(|o| o.link_id != link_id);
    }

    /// Most recently used origin.
    pub fn last_link_origin(&self) -> Option<LinkOrigin> {
        self.origins.lock().front().copied()
    }
}

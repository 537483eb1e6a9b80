//! Cnode locking: the content lock, the truncate lock and multi-node ordering.
//!
//! Locks are acquired and released explicitly (one release per acquisition)
//! so they can be held across the catalog calls of a single operation.

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use super::Cnode;
use crate::catalog::records::{Cnid, ALLOCATION_FILE_ID, EXTENTS_FILE_ID};
use crate::error::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Fail with `NotFound` if the cnode no longer exists in the catalog.
    Default,
    AllowNoExists,
}

#[derive(Debug, Default)]
struct LockState {
    /// One entry per shared acquisition still held.
    readers: Vec<ThreadId>,
    owner: Option<ThreadId>,
    depth: u32,
    writers_waiting: u32,
}

/// Readers-writer lock that knows its holders. Waiting writers hold off
/// new readers; a thread that already reads may read again.
#[derive(Debug, Default)]
pub(crate) struct RwCore {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl RwCore {
    fn owned_by_current(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    fn acquire(&self, mode: LockMode) {
        let me = thread::current().id();
        let mut s = self.state.lock();
        match mode {
            LockMode::Shared => {
                let rereading = s.readers.contains(&me);
                while s.owner.is_some() || (s.writers_waiting > 0 && !rereading) {
                    self.cond.wait(&mut s);
                }
                s.readers.push(me);
            }
            LockMode::Exclusive => {
                debug_assert!(
                    !s.readers.contains(&me),
                    "exclusive lock requested while holding it shared"
                );
                s.writers_waiting += 1;
                while s.owner.is_some() || !s.readers.is_empty() {
                    self.cond.wait(&mut s);
                }
                s.writers_waiting -= 1;
                s.owner = Some(me);
                s.depth = 1;
            }
        }
    }

    /// Count another acquisition by the current exclusive owner.
    fn recurse(&self) {
        self.state.lock().depth += 1;
    }

    /// Release one acquisition held by the calling thread.
    fn release(&self) -> LockMode {
        let me = thread::current().id();
        let mut s = self.state.lock();
        if s.owner == Some(me) {
            s.depth -= 1;
            if s.depth == 0 {
                s.owner = None;
                self.cond.notify_all();
            }
            LockMode::Exclusive
        } else {
            assert!(!s.readers.is_empty(), "cnode lock released while not held");
            let at = s.readers.iter().rposition(|&t| t == me).unwrap_or(0);
            s.readers.swap_remove(at);
            if s.readers.is_empty() {
                self.cond.notify_all();
            }
            LockMode::Shared
        }
    }

    fn is_locked(&self) -> bool {
        let s = self.state.lock();
        s.owner.is_some() || !s.readers.is_empty()
    }
}

/// Lock for the extents-overflow and allocation-bitmap pseudo-files; the
/// owning thread may take it again and must release it as many times.
#[derive(Debug, Default)]
pub struct RecursiveLock(RwCore);

impl RecursiveLock {
    fn lock(&self, mode: LockMode) {
        if self.0.owned_by_current() {
            self.0.recurse();
            return;
        }
        self.0.acquire(mode);
    }
}

/// Lock for every other cnode; relocking by the owner is a bug.
#[derive(Debug, Default)]
pub struct PlainLock(RwCore);

impl PlainLock {
    fn lock(&self, mode: LockMode, fileid: Cnid) {
        assert!(
            !self.0.owned_by_current(),
            "cnode {} locked twice by the owning thread",
            fileid
        );
        self.0.acquire(mode);
    }
}

#[derive(Debug)]
pub enum ContentLock {
    Recursive(RecursiveLock),
    Plain(PlainLock),
}

impl ContentLock {
    pub fn for_fileid(fileid: Cnid) -> Self {
        if fileid == EXTENTS_FILE_ID || fileid == ALLOCATION_FILE_ID {
            ContentLock::Recursive(RecursiveLock::default())
        } else {
            ContentLock::Plain(PlainLock::default())
        }
    }

    pub(crate) fn lock(&self, mode: LockMode, fileid: Cnid) {
        match self {
            ContentLock::Recursive(l) => l.lock(mode),
            ContentLock::Plain(l) => l.lock(mode, fileid),
        }
    }

    pub(crate) fn unlock(&self) -> LockMode {
        match self {
            ContentLock::Recursive(l) => l.0.release(),
            ContentLock::Plain(l) => l.0.release(),
        }
    }

    pub fn is_locked(&self) -> bool {
        match self {
            ContentLock::Recursive(l) => l.0.is_locked(),
            ContentLock::Plain(l) => l.0.is_locked(),
        }
    }

    pub fn held_exclusive(&self) -> bool {
        match self {
            ContentLock::Recursive(l) => l.0.owned_by_current(),
            ContentLock::Plain(l) => l.0.owned_by_current(),
        }
    }
}

/// Guards size changes. Shared for read/write/page-in, exclusive for truncation.
#[derive(Debug, Default)]
pub struct TruncateLock(RwCore);

impl TruncateLock {
    /// Returns false when the acquisition was skipped because the caller
    /// already holds the lock exclusively.
    pub(crate) fn lock(&self, mode: LockMode, skip_if_exclusive: bool) -> bool {
        if self.0.owned_by_current() {
            assert!(
                skip_if_exclusive,
                "truncate lock taken twice by the owning thread"
            );
            return false;
        }
        self.0.acquire(mode);
        true
    }

    pub(crate) fn unlock(&self) -> LockMode {
        self.0.release()
    }

    pub fn held_exclusive(&self) -> bool {
        self.0.owned_by_current()
    }
}

/// Truncate lock held on one cnode. Deferred fork releases run when the
/// acquisition that actually took the lock is dropped.
pub struct TruncateGuard<'a> {
    cnode: &'a Cnode,
    acquired: bool,
}

impl<'a> TruncateGuard<'a> {
    pub(crate) fn new(cnode: &'a Cnode, acquired: bool) -> Self {
        Self { cnode, acquired }
    }

    pub fn acquired(&self) -> bool {
        self.acquired
    }
}

impl Drop for TruncateGuard<'_> {
    fn drop(&mut self) {
        if self.acquired {
            self.cnode.truncate.unlock();
            self.cnode.flush_deferred_releases();
        }
    }
}

/// A failed multi-node lock: which cnode failed, and why.
#[derive(Debug)]
pub struct LockSetError {
    pub fileid: Cnid,
    pub error: CatalogError,
}

impl From<LockSetError> for CatalogError {
    fn from(e: LockSetError) -> Self {
        e.error
    }
}

/// Content locks held on several cnodes; released in reverse order on drop.
pub struct LockedCnodes {
    nodes: Vec<Arc<Cnode>>,
    // Locks are owned by the acquiring thread.
    _not_send: PhantomData<*const ()>,
}

impl LockedCnodes {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn fileids(&self) -> Vec<Cnid> {
        self.nodes.iter().map(|c| c.fileid()).collect()
    }
}

impl Drop for LockedCnodes {
    fn drop(&mut self) {
        for cp in self.nodes.iter().rev() {
            cp.unlock();
        }
    }
}

/// Lock every distinct cnode in ascending (fileid, address) order.
pub fn lock_set(
    nodes: &[&Arc<Cnode>],
    mode: LockMode,
    policy: LockPolicy,
) -> Result<LockedCnodes, LockSetError> {
    let mut ordered: Vec<Arc<Cnode>> = nodes.iter().map(|c| Arc::clone(c)).collect();
    ordered.sort_by_key(|c| (c.fileid(), Arc::as_ptr(c) as usize));
    ordered.dedup_by(|a, b| Arc::ptr_eq(a, b));

    let mut held = LockedCnodes {
        nodes: Vec::with_capacity(ordered.len()),
        _not_send: PhantomData,
    };
    for cp in ordered {
        if let Err(error) = cp.lock(mode, policy) {
            let fileid = cp.fileid();
            // Dropping `held` releases everything taken so far.
            drop(held);
            return Err(LockSetError { fileid, error });
        }
        held.nodes.push(cp);
    }
    Ok(held)
}

pub fn lock_pair(
    a: &Arc<Cnode>,
    b: &Arc<Cnode>,
    mode: LockMode,
) -> Result<LockedCnodes, LockSetError> {
    lock_set(&[a, b], mode, LockPolicy::Default)
}

/// Lock up to four cnodes for rename: source dir, source, target dir, target.
pub fn lock_four(
    a: &Arc<Cnode>,
    b: &Arc<Cnode>,
    c: Option<&Arc<Cnode>>,
    d: Option<&Arc<Cnode>>,
    mode: LockMode,
) -> Result<LockedCnodes, LockSetError> {
    let mut nodes = vec![a, b];
    nodes.extend(c);
    nodes.extend(d);
    lock_set(&nodes, mode, LockPolicy::Default)
}

//! Fileid-keyed cnode table.
//!
//! One mutex guards the whole table and every hash-state transition; a single
//! condition variable is broadcast whenever an entry leaves `H_ALLOC`,
//! `H_ATTACH` or `H_TRANSIT`.

use std::cell::Cell;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use super::lock::{LockMode, LockPolicy};
use super::{Cnode, ForkKind, C_DELETED, C_NOEXISTS, H_ALLOC, H_ATTACH, H_TRANSIT, H_WAITING};
use crate::catalog::records::Cnid;
use crate::error::{CatalogError, Result};

struct CacheShared {
    table: Mutex<HashMap<Cnid, Arc<Cnode>>>,
    cond: Condvar,
    /// Deleted-but-open cnodes whose last handle has gone.
    reclaim: Mutex<Vec<Arc<Cnode>>>,
    max_dir_hints: usize,
}

impl CacheShared {
    fn broadcast(&self, cp: &Cnode) {
        if cp.hflags() & H_WAITING != 0 {
            cp.clear_hflags(H_WAITING);
        }
        self.cond.notify_all();
    }

    fn unhash(&self, table: &mut HashMap<Cnid, Arc<Cnode>>, cp: &Arc<Cnode>) {
        if table
            .get(&cp.fileid())
            .is_some_and(|entry| Arc::ptr_eq(entry, cp))
        {
            table.remove(&cp.fileid());
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub want_rsrc: bool,
    /// Return the cnode unlocked.
    pub skip_lock: bool,
    /// Return cnodes already flagged deleted (open handles only).
    pub allow_deleted: bool,
}

pub struct CacheEntry {
    pub handle: CnodeHandle,
    /// Freshly allocated; the caller must populate it and `publish`.
    pub is_new: bool,
    /// The requested fork is not attached yet; the caller attaches it and
    /// `publish`es.
    pub is_attach: bool,
}

#[derive(Clone)]
pub struct CnodeCache {
    shared: Arc<CacheShared>,
}

impl CnodeCache {
    pub fn new(max_dir_hints: usize) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                table: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
                reclaim: Mutex::new(Vec::new()),
                max_dir_hints,
            }),
        }
    }

    fn handle(&self, cnode: Arc<Cnode>, pending: u32) -> CnodeHandle {
        CnodeHandle {
            cnode,
            shared: Arc::clone(&self.shared),
            locked: Cell::new(None),
            pending: Cell::new(pending),
        }
    }

    /// Find the cnode for `fileid`, or insert a fresh one in `H_ALLOC`.
    ///
    /// Entries still being allocated, attached or torn down are waited on.
    /// Unless `skip_lock` is set the cnode comes back locked exclusive.
    pub fn get_or_create(&self, fileid: Cnid, opts: GetOptions) -> Result<CacheEntry> {
        let kind = if opts.want_rsrc {
            ForkKind::Resource
        } else {
            ForkKind::Data
        };
        let mut table = self.shared.table.lock();
        loop {
            if let Some(cp) = table.get(&fileid).cloned() {
                if cp.hflags() & (H_ALLOC | H_ATTACH | H_TRANSIT) != 0 {
                    cp.set_hflags(H_WAITING);
                    self.shared.cond.wait(&mut table);
                    continue;
                }
                if cp.is_deleted() && !opts.allow_deleted {
                    return Err(CatalogError::NotFound);
                }
                let is_attach = !cp.is_dir() && !cp.has_fork(kind);
                let pending = if is_attach {
                    cp.set_hflags(H_ATTACH);
                    H_ATTACH
                } else {
                    0
                };
                cp.refs.fetch_add(1, Ordering::AcqRel);
                drop(table);

                let handle = self.handle(cp, pending);
                if !opts.skip_lock {
                    let policy = if opts.allow_deleted {
                        LockPolicy::AllowNoExists
                    } else {
                        LockPolicy::Default
                    };
                    handle.lock(LockMode::Exclusive, policy)?;
                }
                return Ok(CacheEntry {
                    handle,
                    is_new: false,
                    is_attach,
                });
            }

            let fresh = MutexGuard::unlocked(&mut table, || {
                Arc::new(Cnode::new(fileid, self.shared.max_dir_hints))
            });
            if table.contains_key(&fileid) {
                // Lost the race while allocating; look again.
                continue;
            }
            fresh.set_hflags(H_ALLOC);
            fresh.refs.fetch_add(1, Ordering::AcqRel);
            let handle = self.handle(Arc::clone(&fresh), H_ALLOC);
            if !opts.skip_lock {
                // Nobody else can see it yet.
                handle.lock(LockMode::Exclusive, LockPolicy::AllowNoExists)?;
            }
            table.insert(fileid, fresh);
            debug!("cnode {} allocated", fileid);
            return Ok(CacheEntry {
                handle,
                is_new: true,
                is_attach: false,
            });
        }
    }

    /// Finish allocation or attachment and wake anyone waiting on the entry.
    pub fn publish(&self, handle: &CnodeHandle) {
        let pending = handle.pending.replace(0);
        if pending == 0 {
            return;
        }
        let _table = self.shared.table.lock();
        handle.cnode.clear_hflags(pending);
        self.shared.broadcast(&handle.cnode);
    }

    /// Unhash a cnode. Fails while another thread is attaching a fork.
    pub fn remove(&self, cp: &Arc<Cnode>) -> Result<()> {
        let mut table = self.shared.table.lock();
        if cp.hflags() & H_ATTACH != 0 {
            return Err(CatalogError::Busy(cp.fileid()));
        }
        self.shared.unhash(&mut table, cp);
        cp.clear_hflags(H_TRANSIT);
        self.shared.broadcast(cp);
        debug!("cnode {} removed", cp.fileid());
        Ok(())
    }

    /// Hide a cnode from lookups ahead of its teardown.
    pub fn mark_in_transit(&self, cp: &Arc<Cnode>) {
        let _table = self.shared.table.lock();
        cp.set_hflags(H_TRANSIT);
    }

    /// Look at a cached cnode without taking a reference.
    ///
    /// With `existence_only` any entry counts, even one in transit or already
    /// gone from the catalog.
    pub fn snoop<R>(
        &self,
        fileid: Cnid,
        existence_only: bool,
        f: impl FnOnce(&Cnode) -> R,
    ) -> Option<R> {
        let table = self.shared.table.lock();
        let cp = table.get(&fileid)?;
        if !existence_only
            && (cp.hflags() & (H_ALLOC | H_TRANSIT) != 0 || cp.flags() & C_NOEXISTS != 0)
        {
            return None;
        }
        Some(f(cp))
    }

    /// Evict unreferenced cnodes that hold no directory hints. Their forks
    /// are dropped with them.
    pub fn evict_unused(&self) -> usize {
        let mut table = self.shared.table.lock();
        let before = table.len();
        table.retain(|_, cp| {
            let unused =
                cp.refs() == 0 && cp.hflags() == 0 && cp.with_hints(|h| h.is_empty());
            if unused {
                cp.detach_all_forks();
            }
            !unused
        });
        before - table.len()
    }

    /// Drain the deleted-but-open cnodes whose last handle has dropped.
    pub fn take_reclaimable(&self) -> Vec<Arc<Cnode>> {
        std::mem::take(&mut *self.shared.reclaim.lock())
    }

    /// Visit a snapshot of the cached cnodes outside the table lock.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Cnode>)) {
        let snapshot: Vec<Arc<Cnode>> = self.shared.table.lock().values().cloned().collect();
        for cp in &snapshot {
            f(cp);
        }
    }

    pub fn len(&self) -> usize {
        self.shared.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.table.lock().is_empty()
    }
}

/// One open/lookup reference on a cnode.
///
/// Dropping the handle releases its content lock (if taken through the
/// handle) and the reference. At zero references a deleted cnode is unhashed
/// and queued for reclamation; an idle one with no forks and no directory
/// hints is evicted.
pub struct CnodeHandle {
    cnode: Arc<Cnode>,
    shared: Arc<CacheShared>,
    locked: Cell<Option<LockMode>>,
    /// Hash states this handle is responsible for clearing.
    pending: Cell<u32>,
}

impl CnodeHandle {
    pub fn lock(&self, mode: LockMode, policy: LockPolicy) -> Result<()> {
        self.cnode.lock(mode, policy)?;
        self.locked.set(Some(mode));
        Ok(())
    }

    pub fn unlock(&self) {
        if self.locked.take().is_some() {
            self.cnode.unlock();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get().is_some()
    }

    pub fn arc(&self) -> &Arc<Cnode> {
        &self.cnode
    }

    pub fn cnode(&self) -> &Cnode {
        &self.cnode
    }
}

impl Deref for CnodeHandle {
    type Target = Cnode;

    fn deref(&self) -> &Cnode {
        &self.cnode
    }
}

impl Clone for CnodeHandle {
    /// Take another, unlocked reference.
    fn clone(&self) -> Self {
        let _table = self.shared.table.lock();
        self.cnode.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            cnode: Arc::clone(&self.cnode),
            shared: Arc::clone(&self.shared),
            locked: Cell::new(None),
            pending: Cell::new(0),
        }
    }
}

impl std::fmt::Debug for CnodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CnodeHandle")
            .field("cnode", &self.cnode)
            .field("locked", &self.locked.get())
            .finish()
    }
}

impl Drop for CnodeHandle {
    fn drop(&mut self) {
        self.unlock();
        let cp = &self.cnode;
        let mut table = self.shared.table.lock();

        let pending = self.pending.replace(0);
        if pending & H_ALLOC != 0 {
            // Never populated.
            cp.set_flags(C_NOEXISTS);
            self.shared.unhash(&mut table, cp);
        }
        if pending != 0 {
            cp.clear_hflags(pending);
            self.shared.broadcast(cp);
        }

        if cp.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if cp.is_deleted() {
            self.shared.unhash(&mut table, cp);
            cp.detach_all_forks();
            if cp.flags() & C_DELETED != 0 && cp.flags() & C_NOEXISTS == 0 {
                debug!("cnode {} queued for reclaim", cp.fileid());
                self.shared.reclaim.lock().push(Arc::clone(cp));
            }
        } else if cp.hflags() == 0 && !cp.has_any_fork() && cp.with_hints(|h| h.is_empty()) {
            self.shared.unhash(&mut table, cp);
        }
    }
}

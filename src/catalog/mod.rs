//! The catalog engine: namespace records, thread records and hard links,
//! driven through the `CatalogTree` and `BlockAllocator` collaborators.
//!
//! Callers hold the catalog lock (shared for lookups, exclusive for
//! mutations) around every call; nothing here takes it.

pub mod attr;
pub mod codec;
pub mod hardlink;
pub mod lookup;
pub mod mangle;
pub mod mutate;
pub mod readdir;
pub mod records;
pub mod thread;
pub mod unicode;

use std::sync::Arc;

use dashmap::DashSet;
use tracing::info;

use crate::alloc::BlockAllocator;
use crate::btree::CatalogTree;
use crate::cnode::CnodeCache;
use crate::config::CatalogConfig;
use crate::error::Result;
use crate::volume::{
    PrivateDir, Vcb, DIR_HARDLINKS, DIR_HARDLINK_DIR_NAME, FILE_HARDLINKS,
    FILE_HARDLINK_DIR_NAME,
};

use self::attr::{CatAttr, CatDesc, CD_ISDIR, S_IFDIR};
use self::codec::{build_key_for, build_thread, build_thread_key};
use self::records::*;

pub use self::hardlink::IGNORE_LINK;
pub use self::lookup::LookupResult;
pub use self::mutate::{PreparedRename, RenameOutcome};
pub use self::readdir::{DirEntry, EntriesOutcome, LinkInfo, EOF_COOKIE};

pub struct Catalog {
    tree: Arc<dyn CatalogTree>,
    alloc: Arc<dyn BlockAllocator>,
    vcb: Vcb,
    config: CatalogConfig,
    cache: CnodeCache,
    /// CNIDs handed out by `acquire_cnid` whose records are not in yet.
    reserved: DashSet<Cnid>,
    /// CNIDs that still own extended attributes from a deleted entry.
    orphaned_attrs: DashSet<Cnid>,
}

impl Catalog {
    pub fn new(
        tree: Arc<dyn CatalogTree>,
        alloc: Arc<dyn BlockAllocator>,
        vcb: Vcb,
        config: CatalogConfig,
        cache: CnodeCache,
    ) -> Self {
        Self {
            tree,
            alloc,
            vcb,
            config,
            cache,
            reserved: DashSet::new(),
            orphaned_attrs: DashSet::new(),
        }
    }

    pub fn tree(&self) -> &dyn CatalogTree {
        self.tree.as_ref()
    }

    pub fn allocator(&self) -> &dyn BlockAllocator {
        self.alloc.as_ref()
    }

    pub fn vcb(&self) -> &Vcb {
        &self.vcb
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn cache(&self) -> &CnodeCache {
        &self.cache
    }

    pub fn add_orphaned_attrs(&self, cnid: Cnid) {
        self.orphaned_attrs.insert(cnid);
    }

    pub fn clear_orphaned_attrs(&self, cnid: Cnid) {
        self.orphaned_attrs.remove(&cnid);
    }

    pub fn orphaned_attrs(&self) -> Vec<Cnid> {
        let mut ids: Vec<Cnid> = self.orphaned_attrs.iter().map(|id| *id).collect();
        ids.sort_unstable();
        ids
    }

    /// Every record in key order.
    pub fn snapshot(&self) -> Result<Vec<(CatalogKey, CatalogRecord)>> {
        let mut out = Vec::with_capacity(self.tree.record_count());
        self.tree
            .iterate(&CatalogKey::default(), false, &mut |key, rec, _| {
                out.push((key.clone(), rec.clone()));
                true
            })?;
        Ok(out)
    }

    /// Lay down an empty volume: the root folder, its thread, and the two
    /// private hard-link directories.
    pub fn initialize(&self, volume_name: &str) -> Result<()> {
        let now = now_bsd();
        let root_key = build_key_for(ROOT_PARENT_ID, volume_name)?;
        let mut root = folder_record(ROOT_FOLDER_ID, 0o755, now);
        root.valence = 2;
        root.folder_count = 2;
        self.tree.insert(
            &build_thread_key(ROOT_FOLDER_ID),
            CatalogRecord::Thread(build_thread(&root_key, true)),
        )?;
        self.tree.insert(&root_key, CatalogRecord::Folder(root))?;

        for (which, name) in [
            (FILE_HARDLINKS, FILE_HARDLINK_DIR_NAME),
            (DIR_HARDLINKS, DIR_HARDLINK_DIR_NAME),
        ] {
            let cnid = self.acquire_cnid()?;
            let mut attr = CatAttr::new_entry(S_IFDIR, 0, 0);
            attr.fileid = cnid;
            attr.itime = now;
            let mut desc = CatDesc::named(ROOT_FOLDER_ID, name);
            desc.flags |= CD_ISDIR;
            let created = self.create(cnid, &desc, &attr);
            self.release_cnid(cnid);
            created?;
            self.vcb.with_header(|h| {
                h.private_dirs[which] = PrivateDir {
                    cnid,
                    create_date: now,
                };
            });
        }
        self.vcb.with_header(|h| {
            h.name = volume_name.to_string();
            h.create_date = now;
            h.local_create_date = to_hfs_time(now);
            h.folder_count = 2;
        });
        info!("initialized volume {} ({} records)", volume_name, self.tree.record_count());
        Ok(())
    }
}

fn folder_record(cnid: Cnid, perms: u16, now: i64) -> FolderRecord {
    let date = to_hfs_time(now);
    FolderRecord {
        flags: REC_THREAD_EXISTS | REC_HAS_FOLDER_COUNT,
        folder_id: cnid,
        dates: CatalogDates {
            create: date,
            content_mod: date,
            attribute_mod: date,
            access: date,
            backup: 0,
        },
        bsd: BsdInfo {
            file_mode: S_IFDIR | perms,
            ..Default::default()
        },
        ..Default::default()
    }
}

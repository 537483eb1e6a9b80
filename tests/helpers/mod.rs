#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hfscat::alloc::BitmapAllocator;
use hfscat::btree::{CatalogTree, MemTree, NodeHint};
use hfscat::catalog::attr::{CatAttr, CatDesc, CD_ISDIR, S_IFDIR, S_IFREG};
use hfscat::catalog::records::{CatalogKey, CatalogRecord, Cnid};
use hfscat::catalog::Catalog;
use hfscat::cnode::CnodeCache;
use hfscat::config::CatalogConfig;
use hfscat::error::{CatalogError, Result};
use hfscat::vnops::Mount;
use hfscat::volume::{Vcb, VolumeHeader};

pub const UID: u32 = 501;
pub const GID: u32 = 20;

/// A fresh in-memory volume named "Test".
pub fn mount() -> Mount {
    mount_with(CatalogConfig::default())
}

pub fn mount_with(config: CatalogConfig) -> Mount {
    Mount::format("Test", config, 4096).expect("format volume")
}

/// A volume whose B-tree can be told to fail its next insert or delete.
pub fn faulty_mount() -> (Arc<FaultyTree>, Mount) {
    let config = CatalogConfig::default();
    let tree = Arc::new(FaultyTree::new(MemTree::new(config.case_sensitive)));
    let alloc = Arc::new(BitmapAllocator::new(config.block_size, 4096));
    let mount = Mount::format_on(tree.clone(), alloc, "Test", config).expect("format volume");
    (tree, mount)
}

/// Every catalog record, for before/after comparisons.
pub fn snapshot(mount: &Mount) -> Vec<(CatalogKey, CatalogRecord)> {
    mount.catalog().snapshot().expect("snapshot catalog")
}

/// Thread records that point at `cnid`.
pub fn thread_count(mount: &Mount, cnid: Cnid) -> usize {
    snapshot(mount)
        .iter()
        .filter(|(key, rec)| key.name.is_empty() && key.parent_id == cnid && rec.is_thread())
        .count()
}

/// A freshly initialized catalog over in-memory collaborators.
pub fn catalog() -> Catalog {
    catalog_with(CatalogConfig::default())
}

pub fn catalog_with(config: CatalogConfig) -> Catalog {
    catalog_on(config, Arc::new(BitmapAllocator::new(512, 1024)))
}

pub fn catalog_on(config: CatalogConfig, alloc: Arc<BitmapAllocator>) -> Catalog {
    let tree = Arc::new(MemTree::new(config.case_sensitive));
    let cat = Catalog::new(
        tree,
        alloc,
        Vcb::new(VolumeHeader::default()),
        config,
        CnodeCache::new(8),
    );
    cat.initialize("Test").expect("initialize catalog");
    cat
}

pub fn file_attr(cnid: Cnid) -> CatAttr {
    let mut attr = CatAttr::new_entry(S_IFREG | 0o644, UID, GID);
    attr.fileid = cnid;
    attr
}

pub fn dir_attr(cnid: Cnid) -> CatAttr {
    let mut attr = CatAttr::new_entry(S_IFDIR | 0o755, UID, GID);
    attr.fileid = cnid;
    attr
}

/// Create a file or directory under `parent` with a fresh CNID.
pub fn make(cat: &Catalog, parent: Cnid, name: &str, dir: bool) -> CatDesc {
    let cnid = cat.acquire_cnid().expect("acquire cnid");
    let mut desc = CatDesc::named(parent, name);
    let attr = if dir {
        desc.flags |= CD_ISDIR;
        dir_attr(cnid)
    } else {
        file_attr(cnid)
    };
    let out = cat.create(cnid, &desc, &attr).expect("create entry");
    cat.release_cnid(cnid);
    out
}

/// Wraps `MemTree` with one-shot failure switches.
pub struct FaultyTree {
    inner: MemTree,
    pub fail_leaf_insert: AtomicBool,
    pub fail_thread_insert: AtomicBool,
    pub fail_thread_delete: AtomicBool,
    pub fail_leaf_delete: AtomicBool,
}

impl FaultyTree {
    pub fn new(inner: MemTree) -> Self {
        Self {
            inner,
            fail_leaf_insert: AtomicBool::new(false),
            fail_thread_insert: AtomicBool::new(false),
            fail_thread_delete: AtomicBool::new(false),
            fail_leaf_delete: AtomicBool::new(false),
        }
    }

    pub fn arm(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }
}

fn injected() -> CatalogError {
    CatalogError::Io(std::io::Error::other("injected fault"))
}

impl CatalogTree for FaultyTree {
    fn search(&self, key: &CatalogKey, hint: NodeHint) -> Result<(CatalogRecord, NodeHint)> {
        self.inner.search(key, hint)
    }

    fn insert(&self, key: &CatalogKey, record: CatalogRecord) -> Result<NodeHint> {
        let flag = if record.is_thread() {
            &self.fail_thread_insert
        } else {
            &self.fail_leaf_insert
        };
        if flag.swap(false, Ordering::SeqCst) {
            return Err(CatalogError::NoSpace);
        }
        self.inner.insert(key, record)
    }

    fn delete(&self, key: &CatalogKey) -> Result<()> {
        let flag = if key.name.is_empty() {
            &self.fail_thread_delete
        } else {
            &self.fail_leaf_delete
        };
        if flag.swap(false, Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.delete(key)
    }

    fn update(
        &self,
        key: &CatalogKey,
        hint: NodeHint,
        mutate: &mut dyn FnMut(&mut CatalogRecord) -> Result<()>,
    ) -> Result<NodeHint> {
        self.inner.update(key, hint, mutate)
    }

    fn iterate(
        &self,
        start: &CatalogKey,
        after: bool,
        visit: &mut dyn FnMut(&CatalogKey, &CatalogRecord, NodeHint) -> bool,
    ) -> Result<()> {
        self.inner.iterate(start, after, visit)
    }

    fn record_count(&self) -> usize {
        self.inner.record_count()
    }
}

/// A temp directory holding a volume image path.
pub struct TestImage {
    pub dir: tempfile::TempDir,
}

impl TestImage {
    pub fn new() -> Self {
        TestImage {
            dir: tempfile::tempdir().expect("failed to create image dir"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("volume.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("hfscat-test.log")
    }

    /// Run the CLI against this image.
    pub fn run(&self, args: &[&str]) -> Output {
        run_hfscat(&self.path(), args)
    }

    /// Run the CLI and require success; returns stdout.
    pub fn ok(&self, args: &[&str]) -> String {
        let out = self.run(args);
        assert!(
            out.status.success(),
            "hfscat {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).into_owned()
    }
}

pub fn run_hfscat(image: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hfscat"))
        .arg("--image")
        .arg(image)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run hfscat")
}

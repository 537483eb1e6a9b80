//! Volume control block and on-disk image.

use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::alloc::BitmapState;
use crate::catalog::records::{CatalogKey, CatalogRecord, Cnid, FIRST_USER_CNID};
use crate::config::CatalogConfig;
use crate::error::Result;

/// Volume needs a consistency check.
pub const VOL_INCONSISTENT: u32 = 0x0800;
/// The CNID space has wrapped at least once.
pub const VOL_CNIDS_REUSED: u32 = 0x1000;

pub const FILE_HARDLINKS: usize = 0;
pub const DIR_HARDLINKS: usize = 1;

pub const FILE_HARDLINK_DIR_NAME: &str = "\0\0\0\0HFS+ Private Data";
pub const DIR_HARDLINK_DIR_NAME: &str = ".HFS+ Private Directory Data\r";
pub const FILE_INODE_PREFIX: &str = "iNode";
pub const DIR_INODE_PREFIX: &str = "dir_";
pub const TEMP_PREFIX: &str = "temp";

pub const JOURNAL_FILE_NAME: &str = ".journal";
pub const JOURNAL_INFO_BLOCK_NAME: &str = ".journal_info_block";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateDir {
    pub cnid: Cnid,
    /// Creation time; doubles as the hard-link epoch stamped on link records.
    pub create_date: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeHeader {
    pub name: String,
    pub attributes: u32,
    pub create_date: i64,
    /// Create date in local time, HFS encoding; recorded in directory aliases.
    pub local_create_date: u32,
    pub next_catalog_id: Cnid,
    pub file_count: u32,
    pub folder_count: u32,
    pub private_dirs: [PrivateDir; 2],
    pub journal_file_id: Cnid,
    pub journal_info_block_id: Cnid,
}

impl Default for VolumeHeader {
    fn default() -> Self {
        Self {
            name: String::new(),
            attributes: 0,
            create_date: 0,
            local_create_date: 0,
            next_catalog_id: FIRST_USER_CNID,
            file_count: 0,
            folder_count: 0,
            private_dirs: [PrivateDir::default(); 2],
            journal_file_id: 0,
            journal_info_block_id: 0,
        }
    }
}

/// Mutable volume state shared by every catalog operation.
pub struct Vcb {
    header: Mutex<VolumeHeader>,
}

impl Vcb {
    pub fn new(header: VolumeHeader) -> Self {
        Self {
            header: Mutex::new(header),
        }
    }

    pub fn header(&self) -> VolumeHeader {
        self.header.lock().clone()
    }

    pub fn with_header<R>(&self, f: impl FnOnce(&mut VolumeHeader) -> R) -> R {
        f(&mut self.header.lock())
    }

    pub fn private_dir(&self, which: usize) -> PrivateDir {
        self.header.lock().private_dirs[which]
    }

    pub fn is_private_dir(&self, cnid: Cnid) -> bool {
        cnid != 0 && self.header.lock().private_dirs.iter().any(|d| d.cnid == cnid)
    }

    pub fn is_journal_file(&self, cnid: Cnid) -> bool {
        let h = self.header.lock();
        cnid != 0 && (cnid == h.journal_file_id || cnid == h.journal_info_block_id)
    }

    pub fn cnids_reused(&self) -> bool {
        self.header.lock().attributes & VOL_CNIDS_REUSED != 0
    }

    pub fn is_inconsistent(&self) -> bool {
        self.header.lock().attributes & VOL_INCONSISTENT != 0
    }

    /// Persist the "needs fsck" bit. The operation that noticed keeps going.
    pub fn mark_inconsistent(&self, reason: &str) {
        let mut h = self.header.lock();
        if h.attributes & VOL_INCONSISTENT == 0 {
            error!("volume {} marked inconsistent: {}", h.name, reason);
        }
        h.attributes |= VOL_INCONSISTENT;
    }

    pub fn adjust_counts(&self, is_dir: bool, delta: i32) {
        let mut h = self.header.lock();
        let count = if is_dir {
            &mut h.folder_count
        } else {
            &mut h.file_count
        };
        *count = count.saturating_add_signed(delta);
    }
}

/// Everything needed to reopen a volume.
#[derive(Debug, Serialize, Deserialize)]
pub struct VolumeImage {
    pub header: VolumeHeader,
    pub config: CatalogConfig,
    pub records: Vec<(CatalogKey, CatalogRecord)>,
    pub allocator: BitmapState,
    #[serde(default)]
    pub orphaned_attrs: Vec<Cnid>,
}

impl VolumeImage {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}

//! On-disk catalog keys and records.
//!
//! Layouts follow TN1150 (HFS Plus Volume Format). Records are kept as typed
//! structs; the byte-level page encoding belongs to the B-tree layer.

use std::fmt;

use serde::{Deserialize, Serialize};

pub type Cnid = u32;

pub const ROOT_PARENT_ID: Cnid = 1;
pub const ROOT_FOLDER_ID: Cnid = 2;
pub const EXTENTS_FILE_ID: Cnid = 3;
pub const CATALOG_FILE_ID: Cnid = 4;
pub const BAD_BLOCK_FILE_ID: Cnid = 5;
pub const ALLOCATION_FILE_ID: Cnid = 6;
pub const STARTUP_FILE_ID: Cnid = 7;
pub const ATTRIBUTES_FILE_ID: Cnid = 8;
pub const FIRST_USER_CNID: Cnid = 16;

/// Longest catalog name, in UTF-16 units.
pub const MAX_NAME_UNITS: usize = 255;

/// Longest externally visible name, in UTF-8 bytes.
pub const NAME_MAX: usize = 255;

/// Upper bound on hard links per inode, also the sibling-chain walk ceiling.
pub const HFS_LINK_MAX: u32 = 32767;

// Catalog record flags.
pub const REC_FILE_LOCKED: u16 = 0x0001;
pub const REC_THREAD_EXISTS: u16 = 0x0002;
pub const REC_HAS_ATTRIBUTES: u16 = 0x0004;
pub const REC_HAS_SECURITY: u16 = 0x0008;
pub const REC_HAS_FOLDER_COUNT: u16 = 0x0010;
pub const REC_HAS_LINK_CHAIN: u16 = 0x0020;
pub const REC_HAS_CHILD_LINK: u16 = 0x0040;
pub const REC_HAS_DATE_ADDED: u16 = 0x0080;

pub const fn four_cc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

pub const HARDLINK_FILE_TYPE: u32 = four_cc(b"hlnk");
pub const HFSPLUS_CREATOR: u32 = four_cc(b"hfs+");
pub const ALIAS_TYPE: u32 = four_cc(b"fdrp");
pub const ALIAS_CREATOR: u32 = four_cc(b"MACS");

/// Finder flag marking an alias file.
pub const FINDER_IS_ALIAS: u16 = 0x8000;

/// Seconds between the HFS+ epoch (1904-01-01) and the Unix epoch.
pub const MAC_EPOCH_OFFSET: i64 = 2_082_844_800;

pub fn to_bsd_time(hfs: u32) -> i64 {
    if hfs == 0 {
        0
    } else {
        i64::from(hfs) - MAC_EPOCH_OFFSET
    }
}

pub fn to_hfs_time(bsd: i64) -> u32 {
    if bsd <= 0 {
        0
    } else {
        (bsd + MAC_EPOCH_OFFSET).min(i64::from(u32::MAX)) as u32
    }
}

pub fn now_bsd() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A catalog name as stored on disk: UTF-16 code units, no terminator.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HfsName(pub Vec<u16>);

impl HfsName {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn units(&self) -> &[u16] {
        &self.0
    }
}

impl fmt::Debug for HfsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf16_lossy(&self.0))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogKey {
    pub parent_id: Cnid,
    pub name: HfsName,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

pub type ExtentRecord = [ExtentDescriptor; 8];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: ExtentRecord,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    /// Raw device, inode number of a link, or link count of an inode.
    pub special: u32,
}

/// Finder user info (FndrFileInfo / FndrDirInfo), big-endian on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinderUserInfo(pub [u8; 16]);

impl FinderUserInfo {
    pub fn file_type(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn creator(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    pub fn finder_flags(&self) -> u16 {
        u16::from_be_bytes([self.0[8], self.0[9]])
    }

    pub fn set_type_creator(&mut self, file_type: u32, creator: u32) {
        self.0[0..4].copy_from_slice(&file_type.to_be_bytes());
        self.0[4..8].copy_from_slice(&creator.to_be_bytes());
    }

    pub fn set_finder_flags(&mut self, flags: u16) {
        self.0[8..10].copy_from_slice(&flags.to_be_bytes());
    }
}

/// Extended Finder info; carries date-added and the write generation counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinderExtInfo(pub [u8; 16]);

impl FinderExtInfo {
    pub fn date_added(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    pub fn set_date_added(&mut self, date: u32) {
        self.0[4..8].copy_from_slice(&date.to_be_bytes());
    }

    pub fn write_gen_counter(&self) -> u32 {
        u32::from_be_bytes([self.0[12], self.0[13], self.0[14], self.0[15]])
    }

    pub fn set_write_gen_counter(&mut self, gen: u32) {
        self.0[12..16].copy_from_slice(&gen.to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDates {
    pub create: u32,
    pub content_mod: u32,
    pub attribute_mod: u32,
    pub access: u32,
    pub backup: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub flags: u16,
    pub valence: u32,
    pub folder_id: Cnid,
    pub dates: CatalogDates,
    pub bsd: BsdInfo,
    pub user_info: FinderUserInfo,
    pub finder_info: FinderExtInfo,
    pub text_encoding: u32,
    /// Number of subfolders, valid with `REC_HAS_FOLDER_COUNT`.
    pub folder_count: u32,
    /// First link of a directory inode, valid with `REC_HAS_LINK_CHAIN`.
    pub first_link_id: Cnid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub flags: u16,
    pub file_id: Cnid,
    pub dates: CatalogDates,
    pub bsd: BsdInfo,
    pub user_info: FinderUserInfo,
    pub finder_info: FinderExtInfo,
    pub text_encoding: u32,
    /// Inodes only: first link in the sibling chain.
    pub first_link_id: Cnid,
    /// Links only: neighbours in the sibling chain (0 terminates).
    pub prev_link_id: Cnid,
    pub next_link_id: Cnid,
    pub data_fork: ForkData,
    pub rsrc_fork: ForkData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub is_dir: bool,
    pub parent_id: Cnid,
    pub name: HfsName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogRecord {
    Folder(FolderRecord),
    File(FileRecord),
    Thread(ThreadRecord),
}

impl CatalogRecord {
    /// CNID of a folder or file record; 0 for threads.
    pub fn cnid(&self) -> Cnid {
        match self {
            CatalogRecord::Folder(f) => f.folder_id,
            CatalogRecord::File(f) => f.file_id,
            CatalogRecord::Thread(_) => 0,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, CatalogRecord::Folder(_))
    }

    pub fn is_thread(&self) -> bool {
        matches!(self, CatalogRecord::Thread(_))
    }

    pub fn flags(&self) -> u16 {
        match self {
            CatalogRecord::Folder(f) => f.flags,
            CatalogRecord::File(f) => f.flags,
            CatalogRecord::Thread(_) => 0,
        }
    }

    /// Same record type (folder vs. file vs. thread).
    pub fn same_kind(&self, other: &CatalogRecord) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

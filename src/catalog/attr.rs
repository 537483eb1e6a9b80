//! In-memory catalog descriptors, attributes and fork data.

use serde::{Deserialize, Serialize};

use super::records::*;

pub const CD_HASBUF: u8 = 0x01;
pub const CD_ISDIR: u8 = 0x80;

// File mode bits used by the catalog.
pub const S_IFMT: u16 = 0o170000;
pub const S_IFIFO: u16 = 0o010000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFLNK: u16 = 0o120000;

// BSD flags that lock a catalog record.
pub const UF_IMMUTABLE: u32 = 0x0000_0002;
pub const SF_IMMUTABLE: u32 = 0x0002_0000;

/// Catalog descriptor: where an entry lives in the namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatDesc {
    pub parent_cnid: Cnid,
    pub name: String,
    pub cnid: Cnid,
    /// B-tree node hint from the last search that produced this descriptor.
    pub hint: u32,
    pub encoding: u32,
    pub flags: u8,
}

impl CatDesc {
    /// Descriptor for a name lookup under `parent`.
    pub fn named(parent: Cnid, name: &str) -> Self {
        Self {
            parent_cnid: parent,
            name: name.to_string(),
            flags: if name.is_empty() { 0 } else { CD_HASBUF },
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.flags & CD_ISDIR != 0
    }

    pub fn has_name(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Catalog attributes of one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatAttr {
    pub fileid: Cnid,
    pub mode: u16,
    pub recflags: u16,
    pub uid: u32,
    pub gid: u32,
    pub linkcount: u32,
    /// BSD flags: admin flags in bits 16..24, owner flags in bits 0..8.
    pub flags: u32,
    pub itime: i64,
    pub atime: i64,
    pub atimeondisk: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub btime: i64,
    /// Finder user info followed by extended Finder info.
    pub finder_info: [u8; 32],
    pub rdev: u32,
    /// Inode number referenced by a hard link.
    pub linkref: u32,
    pub blocks: u32,
    /// Directory valence.
    pub entries: u32,
    pub dircount: u32,
    pub firstlinkid: Cnid,
    pub encoding: u32,
}

impl CatAttr {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_device(&self) -> bool {
        matches!(self.mode & S_IFMT, S_IFCHR | S_IFBLK)
    }

    pub fn user_info(&self) -> FinderUserInfo {
        let mut info = [0u8; 16];
        info.copy_from_slice(&self.finder_info[..16]);
        FinderUserInfo(info)
    }

    pub fn ext_info(&self) -> FinderExtInfo {
        let mut info = [0u8; 16];
        info.copy_from_slice(&self.finder_info[16..]);
        FinderExtInfo(info)
    }

    pub fn set_user_info(&mut self, info: FinderUserInfo) {
        self.finder_info[..16].copy_from_slice(&info.0);
    }

    pub fn set_ext_info(&mut self, info: FinderExtInfo) {
        self.finder_info[16..].copy_from_slice(&info.0);
    }

    pub fn date_added(&self) -> u32 {
        self.ext_info().date_added()
    }

    pub fn write_gen_counter(&self) -> u32 {
        self.ext_info().write_gen_counter()
    }

    /// Attributes for a newly created entry, stamped with the current time.
    pub fn new_entry(mode: u16, uid: u32, gid: u32) -> Self {
        let now = now_bsd();
        Self {
            mode,
            uid,
            gid,
            linkcount: if mode & S_IFMT == S_IFDIR { 2 } else { 1 },
            itime: now,
            atime: now,
            atimeondisk: now,
            mtime: now,
            ctime: now,
            ..Default::default()
        }
    }

    pub(crate) fn apply_bsd(&mut self, bsd: &BsdInfo) {
        self.uid = bsd.owner_id;
        self.gid = bsd.group_id;
        self.mode = bsd.file_mode;
        self.flags = (u32::from(bsd.admin_flags) << 16) | u32::from(bsd.owner_flags);
    }

    pub(crate) fn apply_dates(&mut self, dates: &CatalogDates) {
        self.itime = to_bsd_time(dates.create);
        self.atime = to_bsd_time(dates.access);
        self.atimeondisk = self.atime;
        self.mtime = to_bsd_time(dates.content_mod);
        self.ctime = to_bsd_time(dates.attribute_mod);
        self.btime = to_bsd_time(dates.backup);
    }

    pub(crate) fn to_dates(&self) -> CatalogDates {
        CatalogDates {
            create: to_hfs_time(self.itime),
            content_mod: to_hfs_time(self.mtime),
            attribute_mod: to_hfs_time(self.ctime),
            access: to_hfs_time(self.atime),
            backup: to_hfs_time(self.btime),
        }
    }
}

/// Fork state of one cnode fork.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatFork {
    pub size: u64,
    /// Size being extended to by an in-flight write; never persisted.
    pub new_size: u64,
    /// Clump size on disk, bytes read while in memory.
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: ExtentRecord,
}

impl CatFork {
    pub fn from_fork_data(data: &ForkData) -> Self {
        Self {
            size: data.logical_size,
            new_size: 0,
            clump_size: data.clump_size,
            total_blocks: data.total_blocks,
            extents: data.extents,
        }
    }

    pub fn to_fork_data(&self) -> ForkData {
        ForkData {
            logical_size: self.size,
            clump_size: self.clump_size,
            total_blocks: self.total_blocks,
            extents: self.extents,
        }
    }
}

/// Translate a folder or file record into catalog attributes.
pub fn attr_from_record(rec: &CatalogRecord) -> Option<CatAttr> {
    let mut attr = CatAttr::default();
    match rec {
        CatalogRecord::Folder(dir) => {
            attr.fileid = dir.folder_id;
            attr.recflags = dir.flags;
            attr.apply_bsd(&dir.bsd);
            attr.apply_dates(&dir.dates);
            if attr.mode & S_IFMT == 0 {
                attr.mode = S_IFDIR | 0o755;
            }
            attr.entries = dir.valence;
            attr.linkcount = if dir.flags & REC_HAS_LINK_CHAIN != 0 {
                dir.bsd.special.max(1)
            } else {
                2
            };
            attr.dircount = dir.folder_count;
            attr.firstlinkid = dir.first_link_id;
            attr.encoding = dir.text_encoding;
            attr.finder_info[..16].copy_from_slice(&dir.user_info.0);
            attr.finder_info[16..].copy_from_slice(&dir.finder_info.0);
        }
        CatalogRecord::File(file) => {
            attr.fileid = file.file_id;
            attr.recflags = file.flags;
            attr.apply_bsd(&file.bsd);
            attr.apply_dates(&file.dates);
            if attr.mode & S_IFMT == 0 {
                attr.mode = S_IFREG | 0o644;
            }
            if attr.is_device() {
                attr.rdev = file.bsd.special;
                attr.linkcount = 1;
            } else if file.flags & REC_HAS_LINK_CHAIN != 0 && file.first_link_id != 0 {
                // Raw inode: special holds the link count.
                attr.linkcount = file.bsd.special.max(1);
            } else {
                attr.linkcount = 1;
            }
            attr.blocks = file
                .data_fork
                .total_blocks
                .saturating_add(file.rsrc_fork.total_blocks);
            attr.firstlinkid = file.first_link_id;
            attr.encoding = file.text_encoding;
            attr.finder_info[..16].copy_from_slice(&file.user_info.0);
            attr.finder_info[16..].copy_from_slice(&file.finder_info.0);
        }
        CatalogRecord::Thread(_) => return None,
    }
    Some(attr)
}

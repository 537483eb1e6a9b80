//! Directory enumeration into packed entry buffers.
//!
//! Entries are written one record behind the cursor so the last entry of a
//! call can carry either the cookie of its successor or `EOF_COOKIE`.

use super::codec::{build_desc, build_key, build_thread_key};
use super::mangle::{mangle, needs_mangling};
use super::records::*;
use super::unicode::encode_utf8_name;
use super::Catalog;
use crate::catalog::attr::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT};
use crate::cnode::dirhint::DirHint;
use crate::error::{CatalogError, Result};

/// `next_cookie` of the last entry in a directory.
pub const EOF_COOKIE: u64 = u64::MAX;

// fileid, next_cookie, reclen, namlen, type
const ENTRY_HEADER_LEN: usize = 8 + 8 + 2 + 2 + 1;

/// Resume position of the entry with `ordinal`, whose record is `cnid`.
pub fn make_cookie(cnid: Cnid, ordinal: u32) -> u64 {
    (u64::from(cnid) << 32) | u64::from(ordinal)
}

pub fn cookie_index(cookie: u64) -> u32 {
    cookie as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub fileid: u64,
    pub next_cookie: u64,
    /// `DT_*` file type.
    pub kind: u8,
    pub name: String,
}

impl DirEntry {
    /// Packed size, padded to 8 bytes.
    pub fn reclen(&self) -> usize {
        (ENTRY_HEADER_LEN + self.name.len() + 1).next_multiple_of(8)
    }

    /// Write the packed form at the start of `buf`; `None` if it does not fit.
    pub fn pack(&self, buf: &mut [u8]) -> Option<usize> {
        let len = self.reclen();
        if buf.len() < len {
            return None;
        }
        let out = &mut buf[..len];
        out.fill(0);
        out[0..8].copy_from_slice(&self.fileid.to_le_bytes());
        out[8..16].copy_from_slice(&self.next_cookie.to_le_bytes());
        out[16..18].copy_from_slice(&(len as u16).to_le_bytes());
        out[18..20].copy_from_slice(&(self.name.len() as u16).to_le_bytes());
        out[20] = self.kind;
        out[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + self.name.len()]
            .copy_from_slice(self.name.as_bytes());
        Some(len)
    }
}

/// Decode packed entries, stopping at the first malformed one.
pub fn parse_entries(buf: &[u8]) -> Vec<DirEntry> {
    let mut out = Vec::new();
    let mut pos = 0;
    while buf.len() - pos >= ENTRY_HEADER_LEN {
        let rec = &buf[pos..];
        let reclen = u16::from_le_bytes([rec[16], rec[17]]) as usize;
        let namlen = u16::from_le_bytes([rec[18], rec[19]]) as usize;
        if reclen == 0 || reclen > rec.len() || ENTRY_HEADER_LEN + namlen >= reclen {
            break;
        }
        let mut fileid = [0u8; 8];
        fileid.copy_from_slice(&rec[0..8]);
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&rec[8..16]);
        let name = &rec[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + namlen];
        out.push(DirEntry {
            fileid: u64::from_le_bytes(fileid),
            next_cookie: u64::from_le_bytes(cookie),
            kind: rec[20],
            name: String::from_utf8_lossy(name).into_owned(),
        });
        pos += reclen;
    }
    out
}

/// A hard link met during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub link_id: Cnid,
    pub inode_id: Cnid,
}

#[derive(Debug, Default)]
pub struct EntriesOutcome {
    /// Bytes written to the buffer.
    pub used: usize,
    pub count: usize,
    pub eof: bool,
    pub links: Vec<LinkInfo>,
}

/// Entry waiting for its successor's cookie.
struct Pending {
    entry: DirEntry,
    cnid: Cnid,
    ordinal: u32,
    /// Key visited just before this entry; resuming starts after it.
    before: CatalogKey,
    link: Option<LinkInfo>,
}

struct Fill<'a> {
    buf: &'a mut [u8],
    out: EntriesOutcome,
}

impl Fill<'_> {
    fn write(&mut self, p: &Pending) -> bool {
        match p.entry.pack(&mut self.buf[self.out.used..]) {
            Some(len) => {
                self.out.used += len;
                self.out.count += 1;
                self.out.links.extend(p.link);
                true
            }
            None => false,
        }
    }
}

fn dt_for_mode(mode: u16) -> u8 {
    match mode & S_IFMT {
        S_IFDIR => libc::DT_DIR,
        S_IFLNK => libc::DT_LNK,
        S_IFCHR => libc::DT_CHR,
        S_IFBLK => libc::DT_BLK,
        S_IFIFO => libc::DT_FIFO,
        0o140000 => libc::DT_SOCK,
        _ => libc::DT_REG,
    }
}

impl Catalog {
    fn hidden_entry(&self, dir_cnid: Cnid, cnid: Cnid) -> bool {
        dir_cnid == ROOT_FOLDER_ID
            && (self.vcb.is_private_dir(cnid) || self.vcb.is_journal_file(cnid))
    }

    fn pending_entry(
        &self,
        key: &CatalogKey,
        rec: &CatalogRecord,
        ordinal: u32,
        before: CatalogKey,
    ) -> Result<Pending> {
        let cnid = rec.cnid();
        let mut name = encode_utf8_name(&key.name)?;
        if needs_mangling(&name) {
            name = mangle(&name, cnid);
        }
        let (fileid, kind, link) = match rec {
            CatalogRecord::Folder(_) => (cnid, libc::DT_DIR, None),
            CatalogRecord::File(file) => match self.link_target(file) {
                Some((inode_id, isdir)) => (
                    inode_id,
                    if isdir { libc::DT_DIR } else { libc::DT_REG },
                    Some(LinkInfo {
                        link_id: cnid,
                        inode_id,
                    }),
                ),
                None => (cnid, dt_for_mode(file.bsd.file_mode), None),
            },
            CatalogRecord::Thread(_) => return Err(CatalogError::NotFound),
        };
        Ok(Pending {
            entry: DirEntry {
                fileid: u64::from(fileid),
                next_cookie: EOF_COOKIE,
                kind,
                name,
            },
            cnid,
            ordinal,
            before,
            link,
        })
    }

    /// Fill `buf` with entries of `dir_cnid` starting at `hint`, and move
    /// `hint` to where the next call should resume.
    ///
    /// Ordinals count every child record, hidden ones included. Stops when
    /// the buffer is full, when `max_link_infos` hard links have been
    /// collected, or at the end of the directory.
    pub fn get_entries(
        &self,
        dir_cnid: Cnid,
        hint: &mut DirHint,
        buf: &mut [u8],
    ) -> Result<EntriesOutcome> {
        let by_name = hint.desc.has_name() && hint.desc.parent_cnid == dir_cnid;
        let start = if by_name {
            build_key(&hint.desc)?
        } else {
            build_thread_key(dir_cnid)
        };
        let first_index = hint.index;
        let max_links = self.config.max_link_infos.max(1);
        let buf_len = buf.len();

        let mut fill = Fill {
            buf,
            out: EntriesOutcome::default(),
        };
        let mut ordinal = if by_name { hint.index } else { 0 };
        let mut last_key = start.clone();
        let mut node_hint = hint.node_hint;
        let mut pending: Option<Pending> = None;
        let mut stopped = false;
        let mut failed = None;

        self.tree.iterate(&start, true, &mut |key, rec, node| {
            if key.parent_id != dir_cnid {
                return false;
            }
            node_hint = node;
            let this = ordinal;
            ordinal += 1;
            let before = std::mem::replace(&mut last_key, key.clone());
            if this < first_index || rec.is_thread() || self.hidden_entry(dir_cnid, rec.cnid()) {
                return true;
            }
            let next = match self.pending_entry(key, rec, this, before) {
                Ok(next) => next,
                Err(e) => {
                    failed = Some(e);
                    return false;
                }
            };
            if let Some(mut prev) = pending.take() {
                prev.entry.next_cookie = make_cookie(next.cnid, next.ordinal);
                if !fill.write(&prev) {
                    pending = Some(prev);
                    stopped = true;
                    return false;
                }
            }
            pending = Some(next);
            if fill.out.links.len() >= max_links {
                stopped = true;
                return false;
            }
            true
        })?;
        if let Some(e) = failed {
            return Err(e);
        }

        let resume = match pending {
            Some(p) if stopped => Some(p),
            Some(mut p) => {
                p.entry.next_cookie = EOF_COOKIE;
                if fill.write(&p) {
                    None
                } else {
                    Some(p)
                }
            }
            None => None,
        };

        let mut out = fill.out;
        match resume {
            Some(p) => {
                if out.count == 0 {
                    return Err(CatalogError::InvalidArgument(format!(
                        "{} byte buffer cannot hold entry {:?}",
                        buf_len, p.entry.name
                    )));
                }
                hint.index = p.ordinal;
                hint.desc = build_desc(&p.before, 0, node_hint, 0, false)?;
                hint.node_hint = node_hint;
            }
            None => {
                out.eof = true;
                hint.index = ordinal;
                hint.desc = Default::default();
                hint.node_hint = node_hint;
            }
        }
        Ok(out)
    }
}

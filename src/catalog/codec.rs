//! Key and record construction.

use super::attr::{CatDesc, CD_HASBUF, CD_ISDIR};
use super::records::*;
use super::unicode::{decode_utf8_name, encode_utf8_name};
use crate::error::Result;

/// Build the catalog key for a descriptor's parent and name.
pub fn build_key(desc: &CatDesc) -> Result<CatalogKey> {
    build_key_for(desc.parent_cnid, &desc.name)
}

pub fn build_key_for(parent: Cnid, name: &str) -> Result<CatalogKey> {
    Ok(CatalogKey {
        parent_id: parent,
        name: decode_utf8_name(name)?,
    })
}

/// Build a descriptor from a catalog key.
pub fn build_desc(
    key: &CatalogKey,
    cnid: Cnid,
    hint: u32,
    encoding: u32,
    isdir: bool,
) -> Result<CatDesc> {
    let name = encode_utf8_name(&key.name)?;
    let mut flags = 0;
    if !name.is_empty() {
        flags |= CD_HASBUF;
    }
    if isdir {
        flags |= CD_ISDIR;
    }
    Ok(CatDesc {
        parent_cnid: key.parent_id,
        name,
        cnid,
        hint,
        encoding,
        flags,
    })
}

/// Thread record pointing back at `key`.
pub fn build_thread(key: &CatalogKey, isdir: bool) -> ThreadRecord {
    ThreadRecord {
        is_dir: isdir,
        parent_id: key.parent_id,
        name: key.name.clone(),
    }
}

/// Key of the thread record for `cnid`: the id as parent, empty name.
pub fn build_thread_key(cnid: Cnid) -> CatalogKey {
    CatalogKey {
        parent_id: cnid,
        name: HfsName::default(),
    }
}

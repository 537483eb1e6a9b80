//! Mangled names for catalog names whose UTF-8 form exceeds `NAME_MAX`.
//!
//! A mangled name is `<prefix>#<CNID in hex><extension>`, cut to fit.
//! The embedded CNID makes it reversible through an id lookup.

use super::records::{Cnid, NAME_MAX};

/// Extensions longer than this (including the dot) are not preserved.
const MAX_EXTENSION_LEN: usize = 15;

pub fn needs_mangling(name: &str) -> bool {
    name.len() > NAME_MAX
}

fn extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(pos) if pos > 0 && name.len() - pos <= MAX_EXTENSION_LEN => &name[pos..],
        _ => "",
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Deterministically shorten `name` to at most `max_len` bytes, embedding `cnid`.
pub fn mangle_name(name: &str, cnid: Cnid, max_len: usize) -> String {
    let id = format!("#{:X}", cnid);
    let ext = extension(name);
    let stem = &name[..name.len() - ext.len()];
    let room = max_len.saturating_sub(id.len() + ext.len());
    let cut = floor_char_boundary(stem, room);
    let mut out = String::with_capacity(max_len);
    out.push_str(&stem[..cut]);
    out.push_str(&id);
    out.push_str(ext);
    out
}

/// Mangle for the external name limit.
pub fn mangle(name: &str, cnid: Cnid) -> String {
    mangle_name(name, cnid, NAME_MAX)
}

/// Pull the CNID out of a name that looks mangled.
pub fn extract_mangled_cnid(name: &str) -> Option<Cnid> {
    let hash = name.rfind('#')?;
    let rest = &name[hash + 1..];
    let digits_end = rest
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(rest.len());
    let digits = &rest[..digits_end];
    let tail = &rest[digits_end..];
    if digits.is_empty() || digits.len() > 8 {
        return None;
    }
    if !tail.is_empty() && !tail.starts_with('.') {
        return None;
    }
    // Mangling always emits upper-case hex.
    if digits.chars().any(|c| c.is_ascii_lowercase()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

//! Catalog name conversion and ordering.
//!
//! POSIX names may not contain '/', while HFS+ names may. The two characters
//! swap between the external (UTF-8) and on-disk (UTF-16) forms.

use std::cmp::Ordering;

use super::records::{CatalogKey, HfsName, MAX_NAME_UNITS};
use crate::error::{CatalogError, Result};

/// Encode an external UTF-8 name into on-disk UTF-16 units.
pub fn decode_utf8_name(name: &str) -> Result<HfsName> {
    if name.is_empty() {
        return Err(CatalogError::InvalidName);
    }
    let units: Vec<u16> = name
        .encode_utf16()
        .map(|u| if u == u16::from(b':') { u16::from(b'/') } else { u })
        .collect();
    if units.len() > MAX_NAME_UNITS {
        return Err(CatalogError::NameTooLong);
    }
    Ok(HfsName(units))
}

/// Decode on-disk UTF-16 units into an external UTF-8 name.
pub fn encode_utf8_name(name: &HfsName) -> Result<String> {
    let swapped: Vec<u16> = name
        .units()
        .iter()
        .map(|&u| if u == u16::from(b'/') { u16::from(b':') } else { u })
        .collect();
    String::from_utf16(&swapped).map_err(|_| CatalogError::InvalidName)
}

fn is_ignorable(unit: u16) -> bool {
    matches!(unit, 0x200C..=0x200F | 0x202A..=0x202E | 0x206A..=0x206F | 0xFEFF)
}

/// Case-fold one UTF-16 unit the way the HFS+ compare does. Ignorable
/// characters fold to `None`; NUL sorts after everything else.
pub fn fold_unit(unit: u16) -> Option<u16> {
    if unit == 0 {
        return Some(0xFFFF);
    }
    if is_ignorable(unit) {
        return None;
    }
    let Some(ch) = char::from_u32(u32::from(unit)) else {
        // Lone surrogate half.
        return Some(unit);
    };
    let mut lower = ch.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(l), None) if (l as u32) <= 0xFFFF => Some(l as u32 as u16),
        _ => Some(unit),
    }
}

pub fn folded_units(units: &[u16]) -> impl Iterator<Item = u16> + '_ {
    units.iter().filter_map(|&u| fold_unit(u))
}

/// Case-insensitive catalog key comparison (HFS+).
pub fn compare_keys(a: &CatalogKey, b: &CatalogKey) -> Ordering {
    a.parent_id
        .cmp(&b.parent_id)
        .then_with(|| folded_units(a.name.units()).cmp(folded_units(b.name.units())))
}

/// Binary catalog key comparison (HFSX).
pub fn compare_keys_binary(a: &CatalogKey, b: &CatalogKey) -> Ordering {
    a.parent_id
        .cmp(&b.parent_id)
        .then_with(|| a.name.units().cmp(b.name.units()))
}

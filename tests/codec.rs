//! Key, name and record conversions that need no catalog.

use std::cmp::Ordering;

use hfscat::catalog::attr::{attr_from_record, CatDesc, SF_IMMUTABLE, S_IFREG, UF_IMMUTABLE};
use hfscat::catalog::codec::{build_desc, build_key, build_key_for, build_thread, build_thread_key};
use hfscat::catalog::mangle::{extract_mangled_cnid, mangle};
use hfscat::catalog::records::*;
use hfscat::catalog::unicode::{compare_keys, compare_keys_binary, decode_utf8_name, encode_utf8_name};
use hfscat::error::CatalogError;

fn key(parent: u32, name: &str) -> CatalogKey {
    CatalogKey {
        parent_id: parent,
        name: decode_utf8_name(name).unwrap(),
    }
}

// ---------------------------------------------------------------------------
// Keys and descriptors
// ---------------------------------------------------------------------------

#[test]
fn test_key_desc_round_trip() {
    for name in ["a", "Read Me.txt", "caf\u{e9}", "with:colon", "\u{1F600}"] {
        let desc = CatDesc::named(42, name);
        let key = build_key(&desc).unwrap();
        let back = build_desc(&key, 100, 0, 0, false).unwrap();
        assert_eq!(back.name, name);
        assert_eq!(back.parent_cnid, 42);
        assert_eq!(back.cnid, 100);
    }
}

#[test]
fn test_build_key_rejects_bad_names() {
    assert!(matches!(
        build_key(&CatDesc::named(2, "")),
        Err(CatalogError::InvalidName)
    ));
    assert!(matches!(
        build_key(&CatDesc::named(2, &"n".repeat(300))),
        Err(CatalogError::NameTooLong)
    ));
}

#[test]
fn test_thread_key_sorts_before_children() {
    let thread = build_thread_key(20);
    assert!(thread.name.is_empty());
    let child = build_key_for(20, "a").unwrap();
    assert_eq!(compare_keys(&thread, &child), Ordering::Less);
    let rec = build_thread(&child, true);
    assert!(rec.is_dir);
    assert_eq!(rec.parent_id, 20);
}

#[test]
fn test_long_utf8_name_decodes() {
    // 255 units of a three-byte character: valid on disk, too long for NAME_MAX.
    let name = "\u{4e2d}".repeat(MAX_NAME_UNITS);
    let key = build_key_for(2, &name).unwrap();
    let desc = build_desc(&key, 30, 0, 0, false).unwrap();
    assert_eq!(desc.name.len(), MAX_NAME_UNITS * 3);
}

// ---------------------------------------------------------------------------
// Records and attributes
// ---------------------------------------------------------------------------

#[test]
fn test_time_conversion() {
    assert_eq!(to_bsd_time(0), 0);
    assert_eq!(to_hfs_time(0), 0);
    let now = 1_700_000_000;
    assert_eq!(to_bsd_time(to_hfs_time(now)), now);
    assert_eq!(to_hfs_time(now) as i64, now + MAC_EPOCH_OFFSET);
}

#[test]
fn test_finder_info_fields() {
    let mut info = FinderUserInfo::default();
    info.set_type_creator(HARDLINK_FILE_TYPE, HFSPLUS_CREATOR);
    assert_eq!(&info.0[0..8], b"hlnkhfs+");
    assert_eq!(info.file_type(), HARDLINK_FILE_TYPE);
    assert_eq!(info.creator(), HFSPLUS_CREATOR);

    let mut ext = FinderExtInfo::default();
    ext.set_date_added(42);
    ext.set_write_gen_counter(7);
    assert_eq!(ext.date_added(), 42);
    assert_eq!(ext.write_gen_counter(), 7);
}

#[test]
fn test_attr_from_file_record() {
    let mut file = FileRecord {
        file_id: 77,
        bsd: BsdInfo {
            owner_id: 501,
            group_id: 20,
            admin_flags: 0x02,
            owner_flags: 0x02,
            file_mode: S_IFREG | 0o600,
            special: 0,
        },
        ..Default::default()
    };
    file.data_fork.total_blocks = 3;
    file.rsrc_fork.total_blocks = 1;
    file.dates.create = to_hfs_time(1_600_000_000);

    let attr = attr_from_record(&CatalogRecord::File(file)).unwrap();
    assert_eq!(attr.fileid, 77);
    assert_eq!(attr.uid, 501);
    assert_eq!(attr.flags, SF_IMMUTABLE | UF_IMMUTABLE);
    assert_eq!(attr.blocks, 4);
    assert_eq!(attr.linkcount, 1);
    assert_eq!(attr.itime, 1_600_000_000);
}

#[test]
fn test_thread_has_no_attr() {
    assert!(attr_from_record(&CatalogRecord::Thread(ThreadRecord::default())).is_none());
}

// ---------------------------------------------------------------------------
// Name conversion and ordering
// ---------------------------------------------------------------------------

#[test]
fn test_slash_colon_swap() {
    let name = decode_utf8_name("a:b").unwrap();
    assert_eq!(name.units()[1], u16::from(b'/'));
    assert_eq!(encode_utf8_name(&name).unwrap(), "a:b");
}

#[test]
fn test_empty_and_long_names() {
    assert!(matches!(decode_utf8_name(""), Err(CatalogError::InvalidName)));
    let long = "x".repeat(MAX_NAME_UNITS + 1);
    assert!(matches!(decode_utf8_name(&long), Err(CatalogError::NameTooLong)));
    assert!(decode_utf8_name(&"x".repeat(MAX_NAME_UNITS)).is_ok());
}

#[test]
fn test_case_folding_compare() {
    assert_eq!(compare_keys(&key(2, "Hello"), &key(2, "hello")), Ordering::Equal);
    assert_ne!(compare_keys_binary(&key(2, "Hello"), &key(2, "hello")), Ordering::Equal);
    assert_eq!(compare_keys(&key(2, "b"), &key(3, "a")), Ordering::Less);
    assert_eq!(compare_keys(&key(2, "a"), &key(2, "B")), Ordering::Less);
}

#[test]
fn test_ignorable_and_nul_ordering() {
    assert_eq!(compare_keys(&key(2, "a\u{200C}b"), &key(2, "ab")), Ordering::Equal);
    // NUL-prefixed private directory names sort after ordinary names.
    assert_eq!(compare_keys(&key(2, "\0\0zz"), &key(2, "zzzz")), Ordering::Greater);
}

// ---------------------------------------------------------------------------
// Mangled names
// ---------------------------------------------------------------------------

#[test]
fn test_mangle_fits_and_embeds_cnid() {
    let name = format!("{}.txt", "a".repeat(300));
    let mangled = mangle(&name, 0x1234);
    assert!(mangled.len() <= NAME_MAX);
    assert!(mangled.ends_with("#1234.txt"));
    assert_eq!(extract_mangled_cnid(&mangled), Some(0x1234));
}

#[test]
fn test_mangle_respects_char_boundaries() {
    let name = "\u{4e2d}".repeat(200);
    let mangled = mangle(&name, 99);
    assert!(mangled.len() <= NAME_MAX);
    assert!(mangled.ends_with("#63"));
    assert_eq!(mangle(&name, 99), mangled);
}

#[test]
fn test_long_extension_dropped() {
    let name = format!("{}.{}", "b".repeat(280), "x".repeat(40));
    let mangled = mangle(&name, 17);
    assert!(mangled.ends_with("#11"));
}

#[test]
fn test_extract_rejects_non_mangled() {
    assert_eq!(extract_mangled_cnid("plain.txt"), None);
    assert_eq!(extract_mangled_cnid("x#"), None);
    assert_eq!(extract_mangled_cnid("x#12zz"), None);
    assert_eq!(extract_mangled_cnid("x#abc"), None);
    assert_eq!(extract_mangled_cnid("x#123456789"), None);
    assert_eq!(extract_mangled_cnid("x#1F"), Some(0x1F));
}

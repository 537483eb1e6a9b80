//! Catalog engine tests: layout, lookups, thread records and mutations,
//! driven directly against a `Catalog` over in-memory collaborators.

mod helpers;

use hfscat::catalog::attr::{CatDesc, CatFork, CD_ISDIR, S_IFREG, UF_IMMUTABLE};
use hfscat::catalog::codec::{build_key_for, build_thread, build_thread_key};
use hfscat::catalog::mangle::mangle;
use hfscat::catalog::records::*;
use hfscat::catalog::Catalog;
use hfscat::cnode::GetOptions;
use hfscat::config::CatalogConfig;
use hfscat::error::CatalogError;
use hfscat::volume::{DIR_HARDLINKS, FILE_HARDLINKS, VOL_CNIDS_REUSED};

use helpers::*;

fn catalog_threads(cat: &Catalog, cnid: Cnid) -> usize {
    cat.snapshot()
        .unwrap()
        .into_iter()
        .filter(|(k, r)| r.is_thread() && k.parent_id == cnid)
        .count()
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

#[test]
fn test_initialize_layout() {
    let cat = catalog();
    let header = cat.vcb().header();
    assert_eq!(header.name, "Test");
    let file_dir = header.private_dirs[FILE_HARDLINKS];
    let dir_dir = header.private_dirs[DIR_HARDLINKS];
    assert!(file_dir.cnid >= FIRST_USER_CNID);
    assert_ne!(file_dir.cnid, dir_dir.cnid);
    assert!(cat.vcb().is_private_dir(dir_dir.cnid));

    // root thread + root + 2 x (thread + folder)
    assert_eq!(cat.tree().record_count(), 6);
    let root = cat.lookup_by_id(ROOT_FOLDER_ID, true, false).unwrap();
    assert_eq!(root.desc.name, "Test");
    assert_eq!(root.desc.parent_cnid, ROOT_PARENT_ID);
    assert_eq!(root.attr.entries, 2);
}

#[test]
fn test_snapshot_in_key_order() {
    let cat = catalog();
    make(&cat, ROOT_FOLDER_ID, "b", false);
    make(&cat, ROOT_FOLDER_ID, "a", false);
    let snap = cat.snapshot().unwrap();
    assert_eq!(snap.len(), cat.tree().record_count());
    let parents: Vec<Cnid> = snap.iter().map(|(k, _)| k.parent_id).collect();
    let mut sorted = parents.clone();
    sorted.sort_unstable();
    assert_eq!(parents, sorted);
}

// ---------------------------------------------------------------------------
// Thread records
// ---------------------------------------------------------------------------

#[test]
fn test_resolve_by_id() {
    let cat = catalog();
    let desc = make(&cat, ROOT_FOLDER_ID, "file", false);
    let (key, rec, _) = cat.resolve_by_id(desc.cnid, false).unwrap();
    assert_eq!(key.parent_id, ROOT_FOLDER_ID);
    assert_eq!(rec.cnid(), desc.cnid);
}

#[test]
fn test_missing_thread() {
    let cat = catalog();
    assert!(matches!(cat.resolve_by_id(9999, false), Err(CatalogError::NotFound)));
    assert!(matches!(
        cat.resolve_by_id(EXTENTS_FILE_ID, false),
        Err(CatalogError::NotFound)
    ));
    assert!(!cat.vcb().is_inconsistent());
}

#[test]
fn test_empty_thread_name_flags_volume() {
    let cat = catalog();
    cat.tree()
        .insert(
            &build_thread_key(500),
            CatalogRecord::Thread(ThreadRecord {
                is_dir: false,
                parent_id: ROOT_FOLDER_ID,
                name: HfsName::default(),
            }),
        )
        .unwrap();
    assert!(matches!(cat.resolve_by_id(500, false), Err(CatalogError::NotFound)));
    assert!(cat.vcb().is_inconsistent());
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

#[test]
fn test_lookup_by_name_and_id() {
    let cat = catalog();
    let created = make(&cat, ROOT_FOLDER_ID, "Notes.txt", false);
    let by_name = cat
        .lookup_by_name(&CatDesc::named(ROOT_FOLDER_ID, "notes.TXT"), false)
        .unwrap();
    assert_eq!(by_name.cnid, created.cnid);
    assert_eq!(by_name.desc.name, "Notes.txt");
    assert_eq!(by_name.attr.uid, UID);
    assert!(by_name.fork.is_some());

    let by_id = cat.lookup_by_id(created.cnid, false, false).unwrap();
    assert_eq!(by_id.desc, by_name.desc);
    assert_eq!(by_id.attr, by_name.attr);
}

#[test]
fn test_case_sensitive_volume() {
    let mut config = CatalogConfig::default();
    config.case_sensitive = true;
    let cat = catalog_with(config);
    make(&cat, ROOT_FOLDER_ID, "Notes", false);
    assert!(matches!(
        cat.lookup_by_name(&CatDesc::named(ROOT_FOLDER_ID, "notes"), false),
        Err(CatalogError::NotFound)
    ));
}

#[test]
fn test_mangled_lookup() {
    let cat = catalog();
    // 200 three-byte characters: fits on disk, too long for NAME_MAX.
    let long = format!("{}.txt", "\u{4e2d}".repeat(200));
    let created = make(&cat, ROOT_FOLDER_ID, &long, false);
    let mangled = mangle(&long, created.cnid);

    let found = cat
        .lookup_by_name(&CatDesc::named(ROOT_FOLDER_ID, &mangled), false)
        .unwrap();
    assert_eq!(found.cnid, created.cnid);
    assert_eq!(found.desc.name, long);

    // Wrong parent.
    let sub = make(&cat, ROOT_FOLDER_ID, "sub", true);
    assert!(cat
        .lookup_by_name(&CatDesc::named(sub.cnid, &mangled), false)
        .is_err());
    // Same CNID, different prefix bytes.
    let forged = format!("x{}", &mangled[3..]);
    assert!(cat
        .lookup_by_name(&CatDesc::named(ROOT_FOLDER_ID, &forged), false)
        .is_err());
}

#[test]
fn test_short_name_with_hash_is_not_mangled() {
    let cat = catalog();
    let created = make(&cat, ROOT_FOLDER_ID, "file", false);
    let fake = format!("file#{:X}", created.cnid);
    assert!(matches!(
        cat.lookup_by_name(&CatDesc::named(ROOT_FOLDER_ID, &fake), false),
        Err(CatalogError::NotFound)
    ));
}

#[test]
fn test_thread_mismatch_flags_volume() {
    let cat = catalog();
    let a = make(&cat, ROOT_FOLDER_ID, "a", false);
    // Point a bogus thread at a's leaf record.
    let key = build_key_for(ROOT_FOLDER_ID, "a").unwrap();
    cat.tree()
        .insert(&build_thread_key(777), CatalogRecord::Thread(build_thread(&key, false)))
        .unwrap();
    assert!(matches!(cat.lookup_by_id(777, false, false), Err(CatalogError::NotFound)));
    assert!(cat.vcb().is_inconsistent());
    assert!(cat.lookup_by_id(a.cnid, false, false).is_ok());
}

#[test]
fn test_stale_link_bits_cleared() {
    let cat = catalog();
    let a = make(&cat, ROOT_FOLDER_ID, "a", false);
    let key = build_key_for(ROOT_FOLDER_ID, "a").unwrap();
    cat.tree()
        .update(&key, 0, &mut |rec| {
            if let CatalogRecord::File(f) = rec {
                f.flags |= REC_HAS_LINK_CHAIN;
                f.first_link_id = 9999;
                f.bsd.special = 5;
            }
            Ok(())
        })
        .unwrap();
    let found = cat.lookup_by_id(a.cnid, false, false).unwrap();
    assert_eq!(found.attr.recflags & REC_HAS_LINK_CHAIN, 0);
    assert_eq!(found.attr.linkcount, 1);
    assert_eq!(found.attr.linkref, 0);
}

// ---------------------------------------------------------------------------
// Create / delete
// ---------------------------------------------------------------------------

#[test]
fn test_create_lookup_delete() {
    let cat = catalog();
    let parent = make(&cat, ROOT_FOLDER_ID, "P", true);
    let desc = CatDesc::named(parent.cnid, "a");
    let out = cat.create(100, &desc, &file_attr(100)).unwrap();
    assert_eq!(out.cnid, 100);

    let found = cat.lookup_by_name(&desc, false).unwrap();
    assert_eq!(found.attr.fileid, 100);
    assert_eq!(found.desc, cat.lookup_by_id(100, false, false).unwrap().desc);

    cat.delete(&out, &found.attr).unwrap();
    assert!(matches!(
        cat.lookup_by_name(&desc, false),
        Err(CatalogError::NotFound)
    ));
    assert_eq!(catalog_threads(&cat, 100), 0);
    assert!(!cat.vcb().is_inconsistent());
}

#[test]
fn test_failed_create_removes_thread() {
    let cat = catalog();
    make(&cat, ROOT_FOLDER_ID, "a", false);
    let before = cat.tree().record_count();
    let err = cat
        .create(200, &CatDesc::named(ROOT_FOLDER_ID, "A"), &file_attr(200))
        .unwrap_err();
    assert!(matches!(err, CatalogError::AlreadyExists));
    assert_eq!(cat.tree().record_count(), before);
    assert_eq!(catalog_threads(&cat, 200), 0);
}

#[test]
fn test_delete_refuses_system_ids() {
    let cat = catalog();
    let root = cat.lookup_by_id(ROOT_FOLDER_ID, true, false).unwrap();
    assert!(matches!(
        cat.delete(&root.desc, &root.attr),
        Err(CatalogError::InvalidArgument(_))
    ));
}

#[test]
fn test_delete_by_mangled_name() {
    let cat = catalog();
    let long = "\u{4e2d}".repeat(120);
    let created = make(&cat, ROOT_FOLDER_ID, &long, false);
    let mut mangled = CatDesc::named(ROOT_FOLDER_ID, &mangle(&long, created.cnid));
    mangled.cnid = created.cnid;
    cat.delete(&mangled, &file_attr(created.cnid)).unwrap();
    assert!(cat.lookup_by_id(created.cnid, false, false).is_err());
}

// ---------------------------------------------------------------------------
// Rename
// ---------------------------------------------------------------------------

#[test]
fn test_rename_across_directories() {
    let cat = catalog();
    let src = make(&cat, ROOT_FOLDER_ID, "src", true);
    let dst = make(&cat, ROOT_FOLDER_ID, "dst", true);
    let file = make(&cat, src.cnid, "f", false);

    let out = cat
        .rename(&file, &dst, &CatDesc::named(dst.cnid, "g"))
        .unwrap();
    assert_eq!(out.cnid, file.cnid);
    assert_eq!(out.parent_cnid, dst.cnid);

    assert_eq!(catalog_threads(&cat, file.cnid), 1);
    let key = cat.getkey(file.cnid).unwrap();
    assert_eq!(key, build_key_for(dst.cnid, "g").unwrap());
    assert!(cat.tree().search(&build_key_for(src.cnid, "f").unwrap(), 0).is_err());
}

#[test]
fn test_rename_case_variant() {
    let cat = catalog();
    let file = make(&cat, ROOT_FOLDER_ID, "readme", false);
    let root = cat.lookup_by_id(ROOT_FOLDER_ID, true, false).unwrap().desc;
    let out = cat
        .rename(&file, &root, &CatDesc::named(ROOT_FOLDER_ID, "README"))
        .unwrap();
    assert_eq!(out.name, "README");
    let found = cat.lookup_by_id(file.cnid, false, false).unwrap();
    assert_eq!(found.desc.name, "README");
}

#[test]
fn test_rename_onto_other_entry_fails() {
    let cat = catalog();
    let a = make(&cat, ROOT_FOLDER_ID, "a", false);
    make(&cat, ROOT_FOLDER_ID, "b", false);
    let root = cat.lookup_by_id(ROOT_FOLDER_ID, true, false).unwrap().desc;
    let before = cat.snapshot().unwrap();
    assert!(matches!(
        cat.rename(&a, &root, &CatDesc::named(ROOT_FOLDER_ID, "B")),
        Err(CatalogError::AlreadyExists)
    ));
    assert_eq!(cat.snapshot().unwrap(), before);
}

#[test]
fn test_rename_directory_below_itself() {
    let cat = catalog();
    let a = make(&cat, ROOT_FOLDER_ID, "a", true);
    let b = make(&cat, a.cnid, "b", true);
    assert!(matches!(
        cat.rename(&a, &b, &CatDesc::named(b.cnid, "a")),
        Err(CatalogError::InvalidArgument(_))
    ));
    assert!(matches!(
        cat.rename(&a, &a, &CatDesc::named(a.cnid, "self")),
        Err(CatalogError::InvalidArgument(_))
    ));
}

#[test]
fn test_check_move() {
    let cat = catalog();
    let a = make(&cat, ROOT_FOLDER_ID, "a", true);
    let b = make(&cat, a.cnid, "b", true);
    let c = make(&cat, b.cnid, "c", true);
    let other = make(&cat, ROOT_FOLDER_ID, "other", true);

    assert!(matches!(
        cat.check_move(a.cnid, ROOT_FOLDER_ID, c.cnid),
        Err(CatalogError::InvalidArgument(_))
    ));
    assert!(cat.check_move(a.cnid, ROOT_FOLDER_ID, other.cnid).is_ok());
    assert!(cat.check_move(c.cnid, b.cnid, ROOT_FOLDER_ID).is_ok());
    // Staying in the same parent is never a cycle.
    assert!(cat.check_move(b.cnid, a.cnid, a.cnid).is_ok());
}

#[test]
fn test_rename_onto_itself_is_noop() {
    let cat = catalog();
    let a = make(&cat, ROOT_FOLDER_ID, "a", false);
    let root = cat.lookup_by_id(ROOT_FOLDER_ID, true, false).unwrap().desc;
    let before = cat.snapshot().unwrap();
    let prepared = cat
        .rename_prepare(&a, &root, &CatDesc::named(ROOT_FOLDER_ID, "a"))
        .unwrap();
    let outcome = cat.commit_rename(prepared);
    assert!(!outcome.volume_flagged);
    assert_eq!(cat.snapshot().unwrap(), before);
}

#[test]
fn test_commit_without_thread_flags_volume() {
    let cat = catalog();
    let a = make(&cat, ROOT_FOLDER_ID, "a", false);
    let root = cat.lookup_by_id(ROOT_FOLDER_ID, true, false).unwrap().desc;
    let prepared = cat
        .rename_prepare(&a, &root, &CatDesc::named(ROOT_FOLDER_ID, "b"))
        .unwrap();
    cat.tree().delete(&build_thread_key(a.cnid)).unwrap();
    let outcome = cat.commit_rename(prepared);
    assert!(outcome.volume_flagged);
    assert!(cat.vcb().is_inconsistent());
    // The thread was still rewritten.
    assert_eq!(cat.lookup_by_id(a.cnid, false, false).unwrap().desc.name, "b");
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

#[test]
fn test_update_attributes_and_fork() {
    let cat = catalog();
    let file = make(&cat, ROOT_FOLDER_ID, "f", false);
    let found = cat.lookup_by_name(&file, false).unwrap();

    let mut attr = found.attr.clone();
    attr.mode = S_IFREG | 0o600;
    attr.flags = UF_IMMUTABLE;
    attr.mtime = 1_700_000_000;
    let fork = CatFork {
        size: 1000,
        total_blocks: 2,
        ..Default::default()
    };
    cat.update(&found.desc, &attr, Some(&fork), None).unwrap();

    let again = cat.lookup_by_name(&file, false).unwrap();
    assert_eq!(again.attr.mode, S_IFREG | 0o600);
    assert_eq!(again.attr.mtime, 1_700_000_000);
    assert_ne!(again.attr.recflags & REC_FILE_LOCKED, 0);
    assert_ne!(again.attr.recflags & REC_THREAD_EXISTS, 0);
    assert_eq!(again.fork.unwrap().size, 1000);
}

#[test]
fn test_update_keeps_owner_with_unknown_perms() {
    let mut config = CatalogConfig::default();
    config.unknown_perms = true;
    let cat = catalog_with(config.clone());
    let file = make(&cat, ROOT_FOLDER_ID, "f", false);
    let mut attr = cat.lookup_by_name(&file, false).unwrap().attr;
    attr.uid = config.unknown_uid;
    attr.gid = 80;
    cat.update(&file, &attr, None, None).unwrap();
    let again = cat.lookup_by_name(&file, false).unwrap().attr;
    assert_eq!(again.uid, UID);
    assert_eq!(again.gid, 80);
}

#[test]
fn test_update_directory_counts() {
    let cat = catalog();
    let mut dir = CatDesc::named(ROOT_FOLDER_ID, "d");
    dir.flags |= CD_ISDIR;
    let cnid = cat.acquire_cnid().unwrap();
    let dir = cat.create(cnid, &dir, &dir_attr(cnid)).unwrap();
    cat.release_cnid(cnid);

    let mut attr = cat.lookup_by_id(cnid, false, false).unwrap().attr;
    attr.entries = 3;
    attr.dircount = 1;
    cat.update(&dir, &attr, None, None).unwrap();
    let again = cat.lookup_by_id(cnid, false, false).unwrap().attr;
    assert_eq!((again.entries, again.dircount), (3, 1));
}

// ---------------------------------------------------------------------------
// CNID allocation
// ---------------------------------------------------------------------------

#[test]
fn test_acquire_skips_used_ids() {
    let cat = catalog();
    let next = cat.vcb().header().next_catalog_id;
    // A thread record, an orphaned attribute owner and a reservation.
    cat.create(next, &CatDesc::named(ROOT_FOLDER_ID, "x"), &file_attr(next))
        .unwrap();
    cat.add_orphaned_attrs(next + 1);
    let held = cat.acquire_cnid().unwrap();
    assert_eq!(held, next + 2);
    cat.vcb().with_header(|h| h.next_catalog_id = next);
    assert_eq!(cat.acquire_cnid().unwrap(), next + 3);
    cat.release_cnid(held);
    cat.clear_orphaned_attrs(next + 1);
}

#[test]
fn test_acquire_wraps_once() {
    let cat = catalog();
    cat.vcb().with_header(|h| h.next_catalog_id = u32::MAX - 1);
    assert_eq!(cat.acquire_cnid().unwrap(), u32::MAX - 1);
    assert!(!cat.vcb().cnids_reused());

    // Wraps to the first user id, skipping the private directories.
    let private = cat.vcb().header().private_dirs;
    let id = cat.acquire_cnid().unwrap();
    assert!(cat.vcb().cnids_reused());
    assert!(id >= FIRST_USER_CNID);
    assert!(private.iter().all(|d| d.cnid != id));
}

#[test]
fn test_acquire_gives_up_after_second_wrap() {
    let mut config = CatalogConfig::default();
    config.max_cnid = FIRST_USER_CNID + 4;
    let cat = catalog_with(config);
    let mut held = Vec::new();
    let err = loop {
        match cat.acquire_cnid() {
            Ok(cnid) => held.push(cnid),
            Err(e) => break e,
        }
        assert!(held.len() <= 4, "ids never ran out");
    };
    assert!(matches!(err, CatalogError::NoSpace));
    assert!(held.iter().all(|&c| c < FIRST_USER_CNID + 4));

    // Releasing a reservation makes its id available again.
    cat.release_cnid(held[0]);
    assert_eq!(cat.acquire_cnid().unwrap(), held[0]);
}

#[test]
fn test_acquire_skips_cached_cnodes_after_wrap() {
    let cat = catalog();
    let first_free = cat.vcb().header().next_catalog_id;
    let entry = cat
        .cache()
        .get_or_create(first_free, GetOptions { skip_lock: true, ..Default::default() })
        .unwrap();
    cat.cache().publish(&entry.handle);
    cat.vcb().with_header(|h| {
        h.next_catalog_id = first_free;
        h.attributes |= VOL_CNIDS_REUSED;
    });
    assert_eq!(cat.acquire_cnid().unwrap(), first_free + 1);
    drop(entry);
}

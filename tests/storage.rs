//! The in-memory collaborators under the catalog: block allocator, B-tree
//! and volume control block.

use std::sync::atomic::{AtomicUsize, Ordering};

use hfscat::alloc::{
    BitmapAllocator, BlockAllocator, ALLOC_CONTIGUOUS, ALLOC_FLUSH_JOURNAL, ALLOC_METADATA_ZONE,
};
use hfscat::btree::{CatalogTree, MemTree};
use hfscat::catalog::codec::{build_key_for, build_thread, build_thread_key};
use hfscat::catalog::records::{CatalogRecord, FileRecord};
use hfscat::error::CatalogError;
use hfscat::volume::{Vcb, VolumeHeader};

fn file(id: u32) -> CatalogRecord {
    CatalogRecord::File(FileRecord {
        file_id: id,
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

#[test]
fn test_allocate_and_free() {
    let alloc = BitmapAllocator::new(512, 128);
    let (start, count) = alloc.allocate(0, 2, 2, ALLOC_CONTIGUOUS).unwrap();
    assert_eq!(count, 2);
    assert!(start >= 8, "user data stays out of the metadata zone");
    assert!(alloc.is_allocated(start));
    alloc.deallocate(start, count).unwrap();
    assert!(!alloc.is_allocated(start));
    assert_eq!(alloc.free_blocks(), 128);
}

#[test]
fn test_metadata_zone_and_exhaustion() {
    let alloc = BitmapAllocator::new(512, 16);
    let (start, _) = alloc.allocate(0, 1, 1, ALLOC_METADATA_ZONE).unwrap();
    assert_eq!(start, 0);
    assert!(matches!(
        alloc.allocate(0, 32, 32, ALLOC_CONTIGUOUS),
        Err(CatalogError::NoSpace)
    ));
}

#[test]
fn test_write_requires_allocation() {
    let alloc = BitmapAllocator::new(512, 64);
    assert!(alloc.write_blocks(10, &[1, 2, 3]).is_err());
    let (start, _) = alloc.allocate(10, 1, 1, 0).unwrap();
    alloc.write_blocks(start, &[1, 2, 3]).unwrap();
    let block = alloc.read_block(start).unwrap();
    assert_eq!(&block[..3], &[1, 2, 3]);
    assert_eq!(block.len(), 512);
}

#[test]
fn test_out_of_range_block_is_not_allocated() {
    let alloc = BitmapAllocator::new(512, 100);
    let (start, count) = alloc.allocate(0, 92, 92, ALLOC_METADATA_ZONE).unwrap();
    assert_eq!((start, count), (0, 92));
    assert!(alloc.is_allocated(91));
    assert!(!alloc.is_allocated(100));
    assert!(!alloc.is_allocated(128));
    assert!(!alloc.is_allocated(u32::MAX));
}

#[test]
fn test_freed_blocks_wait_for_journal_flush() {
    // Sixteen blocks, the first one reserved for metadata.
    let alloc = BitmapAllocator::new(512, 16);
    let (start, count) = alloc.allocate(0, 15, 15, ALLOC_CONTIGUOUS).unwrap();
    assert_eq!((start, count), (1, 15));
    alloc.deallocate(start, 4).unwrap();
    assert_eq!(alloc.pending_free_blocks(), 4);
    assert_eq!(alloc.free_blocks(), 5);

    // Not reusable until the journal is flushed.
    assert!(matches!(
        alloc.allocate(0, 1, 1, ALLOC_CONTIGUOUS),
        Err(CatalogError::NoSpace)
    ));
    let (again, got) = alloc
        .allocate(0, 1, 1, ALLOC_CONTIGUOUS | ALLOC_FLUSH_JOURNAL)
        .unwrap();
    assert_eq!((again, got), (1, 1));
    assert_eq!(alloc.pending_free_blocks(), 0);
    alloc.allocate(0, 3, 3, ALLOC_CONTIGUOUS).unwrap();
}

#[test]
fn test_saved_state_has_no_pending_frees() {
    let alloc = BitmapAllocator::new(512, 64);
    let (start, count) = alloc.allocate(0, 4, 4, 0).unwrap();
    alloc.deallocate(start, count).unwrap();
    let json = serde_json::to_string(&alloc.state()).unwrap();
    let reloaded = BitmapAllocator::from_state(serde_json::from_str(&json).unwrap());
    assert_eq!(reloaded.pending_free_blocks(), 0);
    assert_eq!(reloaded.allocate(start, 4, 4, 0).unwrap(), (start, count));
}

// ---------------------------------------------------------------------------
// B-tree
// ---------------------------------------------------------------------------

#[test]
fn test_insert_search_delete() {
    let tree = MemTree::new(false);
    let key = build_key_for(2, "a").unwrap();
    tree.insert(&key, file(20)).unwrap();
    assert!(matches!(tree.insert(&key, file(21)), Err(CatalogError::AlreadyExists)));
    let (rec, _) = tree.search(&key, 0).unwrap();
    assert_eq!(rec.cnid(), 20);
    tree.delete(&key).unwrap();
    assert!(matches!(tree.delete(&key), Err(CatalogError::NotFound)));
    assert!(matches!(tree.search(&key, 0), Err(CatalogError::NotFound)));
}

#[test]
fn test_case_insensitive_collision() {
    let tree = MemTree::new(false);
    tree.insert(&build_key_for(2, "Foo").unwrap(), file(20)).unwrap();
    let (rec, _) = tree.search(&build_key_for(2, "fOO").unwrap(), 0).unwrap();
    assert_eq!(rec.cnid(), 20);

    let hfsx = MemTree::new(true);
    hfsx.insert(&build_key_for(2, "Foo").unwrap(), file(20)).unwrap();
    hfsx.insert(&build_key_for(2, "foo").unwrap(), file(21)).unwrap();
    assert_eq!(hfsx.record_count(), 2);
}

#[test]
fn test_iterate_directory_from_thread() {
    let tree = MemTree::new(false);
    let dir_key = build_key_for(2, "dir").unwrap();
    tree.insert(&build_thread_key(30), CatalogRecord::Thread(build_thread(&dir_key, true)))
        .unwrap();
    for (i, name) in ["c", "a", "b"].iter().enumerate() {
        tree.insert(&build_key_for(30, name).unwrap(), file(40 + i as u32)).unwrap();
    }
    tree.insert(&build_key_for(31, "zzz").unwrap(), file(50)).unwrap();

    let mut names = Vec::new();
    tree.iterate(&build_thread_key(30), true, &mut |key, _, _| {
        if key.parent_id != 30 {
            return false;
        }
        names.push(String::from_utf16_lossy(key.name.units()));
        true
    })
    .unwrap();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn test_iterate_across_batches_and_stop_early() {
    let tree = MemTree::new(false);
    for i in 0..100u32 {
        tree.insert(&build_key_for(40, &format!("e{:03}", i)).unwrap(), file(100 + i))
            .unwrap();
    }

    let mut seen = Vec::new();
    tree.iterate(&build_thread_key(40), false, &mut |_, rec, _| {
        seen.push(rec.cnid());
        true
    })
    .unwrap();
    assert_eq!(seen, (100..200).collect::<Vec<_>>());

    let visits = AtomicUsize::new(0);
    tree.iterate(&build_key_for(40, "e050").unwrap(), false, &mut |_, rec, _| {
        visits.fetch_add(1, Ordering::Relaxed);
        rec.cnid() < 152
    })
    .unwrap();
    assert_eq!(visits.load(Ordering::Relaxed), 3);
}

#[test]
fn test_visitor_may_modify_tree() {
    let tree = MemTree::new(false);
    for i in 0..40u32 {
        tree.insert(&build_key_for(50, &format!("k{:02}", i)).unwrap(), file(200 + i))
            .unwrap();
    }
    let mut count = 0;
    tree.iterate(&build_thread_key(50), true, &mut |key, _, _| {
        // Deleting an entry already visited does not disturb the walk.
        tree.delete(key).unwrap();
        count += 1;
        true
    })
    .unwrap();
    assert_eq!(count, 40);
    assert_eq!(tree.record_count(), 0);
}

#[test]
fn test_failed_update_leaves_record() {
    let tree = MemTree::new(false);
    let key = build_key_for(2, "a").unwrap();
    tree.insert(&key, file(20)).unwrap();
    let res = tree.update(&key, 0, &mut |rec| {
        if let CatalogRecord::File(f) = rec {
            f.file_id = 99;
        }
        Err(CatalogError::InvalidArgument("nope".into()))
    });
    assert!(res.is_err());
    assert_eq!(tree.search(&key, 0).unwrap().0.cnid(), 20);
}

// ---------------------------------------------------------------------------
// Volume control block
// ---------------------------------------------------------------------------

#[test]
fn test_mark_inconsistent_is_sticky() {
    let vcb = Vcb::new(VolumeHeader::default());
    assert!(!vcb.is_inconsistent());
    vcb.mark_inconsistent("test");
    vcb.mark_inconsistent("again");
    assert!(vcb.is_inconsistent());
}

#[test]
fn test_counts_saturate() {
    let vcb = Vcb::new(VolumeHeader::default());
    vcb.adjust_counts(false, 2);
    vcb.adjust_counts(false, -5);
    assert_eq!(vcb.header().file_count, 0);
    vcb.adjust_counts(true, 1);
    assert_eq!(vcb.header().folder_count, 1);
}

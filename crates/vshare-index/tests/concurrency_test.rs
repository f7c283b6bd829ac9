//! Several enlistments writing one shared size index at once.

use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::TempDir;
use vshare_cas::ObjectId;
use vshare_index::{LegacySizeStore, SizeIndex};

fn oid(n: u8) -> ObjectId {
    let mut bytes = [0u8; 20];
    bytes[19] = n;
    ObjectId::from_bytes(bytes)
}

#[test]
fn test_concurrent_batches_converge_to_union() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("sizeIndex");
    // Overlapping ranges, as two enlistments that fetched some of the same objects
    let ranges = [(0u8, 40u8), (30, 70), (60, 100), (0, 100)];
    let barrier = Arc::new(Barrier::new(ranges.len()));

    let handles: Vec<_> = ranges
        .into_iter()
        .map(|(start, end)| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let index = SizeIndex::open(&path).unwrap();
                barrier.wait();
                for chunk in (start..end).collect::<Vec<_>>().chunks(7) {
                    index
                        .put_batch(chunk.iter().map(|&n| (oid(n), u64::from(n) * 3)))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let index = SizeIndex::open(&path).unwrap();
    assert_eq!(index.len().unwrap(), 100);
    for n in 0..100u8 {
        assert_eq!(index.get(&oid(n)).unwrap(), Some(u64::from(n) * 3));
    }
}

#[test]
fn test_legacy_stores_merge_into_shared_index() {
    let temp = TempDir::new().unwrap();
    let first = LegacySizeStore::in_databases_dir(temp.path().join("first"));
    let second = LegacySizeStore::in_databases_dir(temp.path().join("second"));
    first.save((0..4).map(|n| (oid(n), u64::from(n)))).unwrap();
    second.save((4..7).map(|n| (oid(n), u64::from(n)))).unwrap();

    let index = SizeIndex::open(temp.path().join("sizeIndex")).unwrap();
    for legacy in [&first, &second] {
        index.put_batch(legacy.load().unwrap()).unwrap();
        legacy.remove().unwrap();
    }

    let ids: Vec<_> = index.entries().unwrap().into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, (0..7).map(oid).collect::<Vec<_>>());
}

//! Shared store behavior with several enlistments writing at once.

use std::fs;
use std::io;
use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::TempDir;
use vshare_cas::{CacheKey, CasError, ObjectFetcher, ObjectId, ObjectsRootManager, SharedObjectStore};

struct FixedFetcher;

impl ObjectFetcher for FixedFetcher {
    fn fetch(&self, oid: &ObjectId) -> io::Result<Vec<u8>> {
        Ok(format!("blob {}", oid).into_bytes())
    }
}

fn ids(n: u8) -> Vec<ObjectId> {
    (0..n)
        .map(|i| {
            let mut bytes = [0u8; 20];
            bytes[0] = i;
            bytes[19] = 0xAA;
            ObjectId::from_bytes(bytes)
        })
        .collect()
}

#[test]
fn test_concurrent_writers_of_same_objects() {
    let temp = TempDir::new().unwrap();
    let manager = ObjectsRootManager::new(temp.path()).unwrap();
    let root = manager.ensure_objects_root(&CacheKey::generate()).unwrap();
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let root = root.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = SharedObjectStore::new(&root);
                barrier.wait();
                for oid in ids(32) {
                    store.ensure_object(&oid, &FixedFetcher).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let store = SharedObjectStore::new(&root);
    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 32);
    for oid in ids(32) {
        let expected = format!("blob {}", oid).into_bytes();
        assert_eq!(store.read(&oid, Some(expected.len() as u64)).unwrap(), expected);
    }
}

#[test]
fn test_deleted_root_surfaces_as_transient_then_recovers() {
    let temp = TempDir::new().unwrap();
    let manager = ObjectsRootManager::new(temp.path()).unwrap();
    let key = CacheKey::generate();
    let root = manager.ensure_objects_root(&key).unwrap();
    let store = SharedObjectStore::new(&root);
    let oid = ids(1)[0];

    store.ensure_object(&oid, &FixedFetcher).unwrap();
    fs::remove_dir_all(&root).unwrap();

    let err = store.read(&oid, None).unwrap_err();
    assert!(matches!(err, CasError::NotFound { .. }));
    assert!(err.is_transient());

    manager.ensure_objects_root(&key).unwrap();
    let (_, fetched) = store.ensure_object(&oid, &FixedFetcher).unwrap();
    assert!(fetched);
    assert!(store.read(&oid, None).is_ok());
}

//! Several enlistments of one origin sharing a cache root.

mod common;

use std::fs;
use std::thread;
use std::time::Duration;

use common::{clone_and_mount, hydrate_all, options, FakeOrigin, ORIGIN};
use vshare_cas::{read_alternates, ObjectId};
use vshare_config::testing::TestEnvironment;
use vshare_enlistment::cache_key::MAPPING_FILE_NAME;
use vshare_enlistment::metadata::{keys, RepoMetadata};
use vshare_enlistment::{prepare, repair_enlistment, status, Enlistment, EnlistmentError};

fn metadata(enlistment: &Enlistment) -> RepoMetadata {
    RepoMetadata::load(enlistment.metadata_path()).unwrap()
}

fn assert_ready(enlistment: &Enlistment) {
    let report = status(enlistment).unwrap().to_string();
    assert!(report.contains("Mount status: Ready"), "{}", report);
}

fn assert_alternates_match(enlistment: &Enlistment) {
    let objects_root = metadata(enlistment).git_objects_root().unwrap();
    let alternates = read_alternates(&enlistment.git_dir()).unwrap().unwrap();
    assert_eq!(alternates, objects_root.to_string_lossy());
}

#[test]
fn test_second_clone_does_not_download_additional_objects() {
    let env = TestEnvironment::new().unwrap();
    let origin = FakeOrigin::with_objects(20);

    let (first, session) = clone_and_mount(&env, &origin, "first");
    hydrate_all(&session, &origin);
    assert_alternates_match(&first);
    let fetched = origin.fetches();
    assert_eq!(fetched, 20);
    let files = env.cache_files().unwrap();

    let (second, session2) = clone_and_mount(&env, &origin, "second");
    hydrate_all(&session2, &origin);
    assert_alternates_match(&second);

    assert_eq!(origin.fetches(), fetched);
    assert_eq!(
        metadata(&first).local_cache_root(),
        metadata(&second).local_cache_root()
    );
    assert_eq!(env.cache_files().unwrap(), files);
}

#[test]
fn test_repair_fixes_corrupt_size_index() {
    let env = TestEnvironment::new().unwrap();
    let origin = FakeOrigin::with_objects(8);
    let (enlistment, session) = clone_and_mount(&env, &origin, "repo");
    hydrate_all(&session, &origin);
    session.unmount().unwrap();

    // Healthy state: nothing to do
    let report = repair_enlistment(&enlistment, &options(&env)).unwrap();
    assert!(report.is_success());
    assert_eq!(report.fixed_count(), 0);

    let index_root = metadata(&enlistment).blob_sizes_root().unwrap();
    let data_file = index_root.join("data.mdb");
    assert!(data_file.is_file());
    fs::write(&data_file, "0000").unwrap();

    let err = prepare(&enlistment, &options(&env)).unwrap_err();
    assert!(
        matches!(err, EnlistmentError::CorruptSizeIndex { .. }),
        "unexpected error: {err}"
    );
    assert!(!status(&enlistment).unwrap().to_string().contains("Ready"));

    let report = repair_enlistment(&enlistment, &options(&env)).unwrap();
    assert!(report.is_success(), "{}", report);
    assert_eq!(report.fixed_count(), 1);

    let session = prepare(&enlistment, &options(&env)).unwrap();
    for (oid, body) in &origin.objects {
        assert_eq!(session.object_size(oid).unwrap(), Some(body.len() as u64));
    }
    assert_ready(&enlistment);
}

#[test]
fn test_mount_upgrades_local_sizes_to_shared_cache() {
    let env = TestEnvironment::new().unwrap();
    let origin = FakeOrigin::with_objects(4);

    let legacy_entries = |digits: &[char]| -> Vec<(ObjectId, u64)> {
        digits
            .iter()
            .map(|&d| {
                let oid = ObjectId::from_hex(&d.to_string().repeat(40)).unwrap();
                (oid, 1u64 << d.to_digit(10).unwrap())
            })
            .collect()
    };

    // Rewrite an enlistment as the 13.0 layout left it: only the layout
    // version and cache paths are recorded, sizes live in the enlistment.
    let downgrade = |enlistment: &Enlistment, entries: &[(ObjectId, u64)]| {
        let current = metadata(enlistment);
        fs::remove_file(enlistment.metadata_path()).unwrap();
        fs::write(enlistment.metadata_path(), "").unwrap();

        let mut legacy = RepoMetadata::load(enlistment.metadata_path()).unwrap();
        legacy.set("DiskLayoutVersion", "13");
        legacy.set("DiskLayoutMinorVersion", "0");
        legacy.set_local_cache_root(&current.local_cache_root().unwrap());
        legacy.set_git_objects_root(&current.git_objects_root().unwrap());
        legacy.save().unwrap();

        enlistment
            .legacy_size_store()
            .save(entries.iter().copied())
            .unwrap();
    };

    let first_entries = legacy_entries(&['0', '1', '2', '3']);
    let (first, session) = clone_and_mount(&env, &origin, "first");
    session.unmount().unwrap();
    let objects_root = metadata(&first).git_objects_root().unwrap();
    downgrade(&first, &first_entries);

    let session = prepare(&first, &options(&env)).unwrap();
    let meta = metadata(&first);
    assert_eq!(meta.get("DiskLayoutVersion"), Some("14"));
    assert_eq!(meta.get("DiskLayoutMinorVersion"), Some("1"));
    assert!(meta.enlistment_id().is_some());

    let index_root = objects_root.parent().unwrap().join("sizeIndex");
    assert_eq!(meta.blob_sizes_root(), Some(index_root.clone()));
    assert!(index_root.join("data.mdb").is_file());
    assert!(!first.legacy_size_store().exists());
    for (oid, size) in &first_entries {
        assert_eq!(session.object_size(oid).unwrap(), Some(*size));
    }

    // A second enlistment's sizes land in the same shared index
    let second_entries = legacy_entries(&['4', '5', '6']);
    let (second, session2) = clone_and_mount(&env, &origin, "second");
    session2.unmount().unwrap();
    downgrade(&second, &second_entries);

    let session2 = prepare(&second, &options(&env)).unwrap();
    assert_eq!(metadata(&second).blob_sizes_root(), Some(index_root));
    for (oid, size) in first_entries.iter().chain(&second_entries) {
        assert_eq!(session.object_size(oid).unwrap(), Some(*size));
        assert_eq!(session2.object_size(oid).unwrap(), Some(*size));
    }
}

#[test]
fn test_clone_cleans_up_stale_mapping_lock() {
    let env = TestEnvironment::new().unwrap();
    let origin = FakeOrigin::with_objects(4);
    let (first, _session) = clone_and_mount(&env, &origin, "first");

    let lock_path = env.cache_root.join(format!("{}.lock", MAPPING_FILE_NAME));
    assert!(!lock_path.exists());
    fs::write(&lock_path, first.root().to_string_lossy().as_bytes()).unwrap();

    let (second, _session2) = clone_and_mount(&env, &origin, "second");
    assert!(!lock_path.exists());

    assert_ready(&first);
    assert_ready(&second);
}

#[test]
fn test_parallel_reads_in_a_shared_cache() {
    let env = TestEnvironment::new().unwrap();
    let origin = FakeOrigin::with_objects(30);
    let (first, session1) = clone_and_mount(&env, &origin, "first");
    let (second, session2) = clone_and_mount(&env, &origin, "second");

    let third = thread::scope(|s| {
        let h1 = s.spawn(|| hydrate_all(&session1, &origin));
        let h2 = s.spawn(|| hydrate_all(&session2, &origin));
        let h3 = s.spawn(|| clone_and_mount(&env, &origin, "third"));
        h1.join().unwrap();
        h2.join().unwrap();
        h3.join().unwrap()
    });

    for enlistment in [&first, &second, &third.0] {
        assert_ready(enlistment);
        assert_alternates_match(enlistment);
    }
}

#[test]
fn test_delete_objects_root_and_mapping_before_mount() {
    let env = TestEnvironment::new().unwrap();
    let origin = FakeOrigin::with_objects(10);
    let (first, session1) = clone_and_mount(&env, &origin, "first");
    let (second, session2) = clone_and_mount(&env, &origin, "second");
    session1.unmount().unwrap();

    let objects_root = metadata(&first).git_objects_root().unwrap();
    assert!(objects_root.is_dir());
    fs::remove_dir_all(&objects_root).unwrap();
    let mapping = env.cache_root.join(MAPPING_FILE_NAME);
    assert!(mapping.is_file());
    fs::remove_file(&mapping).unwrap();

    let session1 = prepare(&first, &options(&env)).unwrap();
    thread::scope(|s| {
        s.spawn(|| hydrate_all(&session1, &origin));
        s.spawn(|| hydrate_all(&session2, &origin));
    });

    assert_ready(&first);
    assert_ready(&second);
    assert_alternates_match(&first);
    assert_alternates_match(&second);
}

#[test]
fn test_delete_objects_root_during_hydrations() {
    let env = TestEnvironment::new().unwrap();
    let origin = FakeOrigin::with_objects(40);
    let (enlistment, _) = clone_and_mount(&env, &origin, "repo");

    let mut opts = options(&env);
    opts.hydration.retries = 50;
    opts.hydration.delay = Duration::from_millis(2);
    let session = prepare(&enlistment, &opts).unwrap();
    let objects_root = session.objects_root().to_path_buf();

    thread::scope(|s| {
        let hydration = s.spawn(|| {
            for _ in 0..3 {
                hydrate_all(&session, &origin);
            }
        });
        while !hydration.is_finished() {
            // Concurrent writers may repopulate the tree mid-delete
            let _ = fs::remove_dir_all(&objects_root);
            thread::sleep(Duration::from_millis(5));
        }
        hydration.join().unwrap();
    });

    assert_ready(&enlistment);
}

#[test]
fn test_mount_reuses_cache_key_when_objects_root_deleted() {
    let env = TestEnvironment::new().unwrap();
    let origin = FakeOrigin::with_objects(6);
    let (enlistment, session) = clone_and_mount(&env, &origin, "repo");
    session.unmount().unwrap();

    let objects_root = metadata(&enlistment).git_objects_root().unwrap();
    assert!(objects_root.is_dir());
    let mapping = env.cache_root.join(MAPPING_FILE_NAME);
    let mapping_contents = fs::read_to_string(&mapping).unwrap();
    assert!(!mapping_contents.is_empty());

    fs::remove_dir_all(&objects_root).unwrap();
    let _session = prepare(&enlistment, &options(&env)).unwrap();

    assert_eq!(metadata(&enlistment).git_objects_root(), Some(objects_root.clone()));
    assert!(objects_root.is_dir());
    assert_eq!(fs::read_to_string(&mapping).unwrap(), mapping_contents);
    assert_alternates_match(&enlistment);
}

#[test]
fn test_mount_uses_new_cache_key_when_cache_root_deleted() {
    let env = TestEnvironment::new().unwrap();
    let origin = FakeOrigin::with_objects(6);
    let (enlistment, session) = clone_and_mount(&env, &origin, "repo");
    session.unmount().unwrap();

    let objects_root = metadata(&enlistment).git_objects_root().unwrap();
    let mapping = env.cache_root.join(MAPPING_FILE_NAME);
    assert!(!fs::read_to_string(&mapping).unwrap().is_empty());

    fs::remove_dir_all(&env.cache_root).unwrap();
    let session = prepare(&enlistment, &options(&env)).unwrap();
    assert!(env.cache_root.is_dir());

    let contents = fs::read_to_string(&mapping).unwrap();
    let prefix = format!("A {{\"Key\":\"{}\",\"Value\":\"", ORIGIN);
    let start = contents.find(&prefix).unwrap() + prefix.len();
    let new_key = &contents[start..start + 32];

    assert!(!objects_root.exists());
    let new_root = metadata(&enlistment).git_objects_root().unwrap();
    assert_ne!(new_root, objects_root);
    assert!(new_root.to_string_lossy().contains(new_key));
    assert!(new_root.is_dir());
    assert_eq!(session.cache_key().as_str(), new_key);
    assert_alternates_match(&enlistment);
}

#[test]
fn test_mount_recreates_objects_root_without_origin_url() {
    let env = TestEnvironment::new().unwrap();
    let origin = FakeOrigin::with_objects(6);
    let (enlistment, session) = clone_and_mount(&env, &origin, "repo");
    session.unmount().unwrap();

    let mut meta = metadata(&enlistment);
    meta.remove(keys::ORIGIN_URL);
    meta.save().unwrap();
    let objects_root = meta.git_objects_root().unwrap();
    let mapping = env.cache_root.join(MAPPING_FILE_NAME);
    let mapping_contents = fs::read_to_string(&mapping).unwrap();

    fs::remove_dir_all(&objects_root).unwrap();
    let session = prepare(&enlistment, &options(&env)).unwrap();

    assert!(objects_root.is_dir());
    assert_eq!(session.objects_root(), objects_root.as_path());
    assert_eq!(metadata(&enlistment).git_objects_root(), Some(objects_root));
    assert_eq!(fs::read_to_string(&mapping).unwrap(), mapping_contents);
    assert_alternates_match(&enlistment);
    assert_ready(&enlistment);
}

#[test]
fn test_status_leaves_missing_size_index_alone() {
    let env = TestEnvironment::new().unwrap();
    let origin = FakeOrigin::with_objects(4);
    let (enlistment, session) = clone_and_mount(&env, &origin, "repo");
    hydrate_all(&session, &origin);
    session.unmount().unwrap();

    let index_root = metadata(&enlistment).blob_sizes_root().unwrap();
    fs::remove_dir_all(&index_root).unwrap();

    let report = status(&enlistment).unwrap().to_string();
    assert!(
        report.contains("Size index entries: unavailable (size index missing)"),
        "{}",
        report
    );
    assert!(!index_root.exists());

    // The next mount recreates it
    let _session = prepare(&enlistment, &options(&env)).unwrap();
    assert!(index_root.join("data.mdb").is_file());
    let report = status(&enlistment).unwrap().to_string();
    assert!(report.contains("Size index entries: 0"), "{}", report);
}

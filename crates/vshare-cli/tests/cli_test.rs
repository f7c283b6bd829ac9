//! End-to-end tests driving the built `vshare` binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use vshare_cas::{ObjectId, SharedObjectStore};
use vshare_config::testing::TestEnvironment;

fn vshare(env: &TestEnvironment, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vshare"))
        .arg("--cache-root")
        .arg(&env.cache_root)
        .args(args)
        .current_dir(&env.enlistments_dir)
        .env("HOME", &env.enlistments_dir)
        .env_remove("VSHARE_CACHE_ROOT")
        .env_remove("VSHARE_LOG")
        .output()
        .expect("Failed to execute vshare")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// A directory of loose objects standing in for a remote
fn make_origin(env: &TestEnvironment, count: u8) -> PathBuf {
    let dir = env.enlistments_dir.join("origin");
    let store = SharedObjectStore::new(&dir);
    for i in 0..count {
        let mut bytes = [0u8; 20];
        bytes[0] = i;
        bytes[19] = 0xee;
        let body = format!("blob {}\n", i).repeat(usize::from(i) + 1);
        store.write(&ObjectId::from_bytes(bytes), body.as_bytes()).unwrap();
    }
    dir
}

fn size_index_data_file(cache_root: &Path) -> PathBuf {
    let key_dir = fs::read_dir(cache_root)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.is_dir())
        .unwrap();
    key_dir.join("sizeIndex").join("data.mdb")
}

#[test]
fn test_version_reports_layout() {
    let env = TestEnvironment::new().unwrap();
    let output = vshare(&env, &["version"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("Disk layout version: 14.1"));
}

#[test]
fn test_second_clone_reuses_cache() {
    let env = TestEnvironment::new().unwrap();
    let origin = make_origin(&env, 6);
    let origin = origin.to_str().unwrap();

    let first = vshare(&env, &["clone", origin, "first"]);
    assert!(first.status.success(), "{}", stderr(&first));
    assert!(stdout(&first).contains("Downloaded:      6"));

    let second = vshare(&env, &["clone", origin, "second"]);
    assert!(second.status.success(), "{}", stderr(&second));
    let out = stdout(&second);
    assert!(out.contains("Downloaded:      0"), "{}", out);
    assert!(out.contains("Already cached:  6"), "{}", out);

    let status = vshare(&env, &["status", "second"]);
    assert!(status.status.success(), "{}", stderr(&status));
    let out = stdout(&status);
    assert!(out.contains("Mount status: Ready"), "{}", out);
    assert!(out.contains("Size index entries: 6"), "{}", out);
    assert!(out.contains("Cached objects: 6 ("), "{}", out);
}

#[test]
fn test_unmount_then_status() {
    let env = TestEnvironment::new().unwrap();
    let origin = make_origin(&env, 2);
    let clone = vshare(&env, &["clone", origin.to_str().unwrap(), "repo", "--no-mount"]);
    assert!(clone.status.success(), "{}", stderr(&clone));
    assert!(!stdout(&vshare(&env, &["status", "repo"])).contains("Ready"));

    assert!(vshare(&env, &["mount", "repo"]).status.success());
    assert!(stdout(&vshare(&env, &["status", "repo"])).contains("Mount status: Ready"));

    assert!(vshare(&env, &["unmount", "repo"]).status.success());
    assert!(stdout(&vshare(&env, &["status", "repo"])).contains("Mount status: Not mounted"));
}

#[test]
fn test_corrupt_size_index_needs_repair() {
    let env = TestEnvironment::new().unwrap();
    let origin = make_origin(&env, 4);
    let clone = vshare(&env, &["clone", origin.to_str().unwrap(), "repo", "--no-mount"]);
    assert!(clone.status.success(), "{}", stderr(&clone));

    let data_file = size_index_data_file(&env.cache_root);
    assert!(data_file.is_file());
    fs::write(&data_file, "0000").unwrap();

    let mount = vshare(&env, &["mount", "repo"]);
    assert!(!mount.status.success());
    assert!(stderr(&mount).contains("vshare repair"), "{}", stderr(&mount));

    let repair = vshare(&env, &["repair", "--enlistment", "repo"]);
    assert!(repair.status.success(), "{}", stderr(&repair));
    assert!(stdout(&repair).contains("Fixed 1 problem(s)"), "{}", stdout(&repair));

    let mount = vshare(&env, &["mount", "repo"]);
    assert!(mount.status.success(), "{}", stderr(&mount));
}

#[test]
fn test_status_outside_enlistment_fails() {
    let env = TestEnvironment::new().unwrap();
    fs::create_dir_all(env.enlistment_root("empty")).unwrap();
    let output = vshare(&env, &["status", "empty"]);
    assert!(!output.status.success());
}

#[test]
fn test_repair_cache_root_when_healthy() {
    let env = TestEnvironment::new().unwrap();
    let origin = make_origin(&env, 3);
    assert!(vshare(&env, &["clone", origin.to_str().unwrap(), "repo"]).status.success());

    let repair = vshare(&env, &["repair"]);
    assert!(repair.status.success(), "{}", stderr(&repair));
    assert!(stdout(&repair).contains("Nothing to repair"));
}

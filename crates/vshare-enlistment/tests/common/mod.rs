//! Shared fixtures for enlistment integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use vshare_cas::{ObjectFetcher, ObjectId};
use vshare_config::testing::TestEnvironment;
use vshare_enlistment::{clone, prepare, Enlistment, EnlistmentOptions, MountSession};

pub const ORIGIN: &str = "https://example.com/team/_git/vshare";

/// In-memory remote that counts every object it serves
pub struct FakeOrigin {
    pub objects: BTreeMap<ObjectId, Vec<u8>>,
    fetches: AtomicUsize,
}

impl FakeOrigin {
    pub fn with_objects(count: u8) -> Self {
        let objects = (0..count)
            .map(|i| {
                let mut bytes = [0u8; 20];
                bytes[0] = i;
                bytes[1] = 0x5a;
                let body = format!("object {} ", i).repeat(usize::from(i) + 1);
                (ObjectId::from_bytes(bytes), body.into_bytes())
            })
            .collect();
        Self {
            objects,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ObjectFetcher for FakeOrigin {
    fn fetch(&self, oid: &ObjectId) -> io::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.objects
            .get(oid)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, oid.to_string()))
    }
}

pub fn options(env: &TestEnvironment) -> EnlistmentOptions {
    EnlistmentOptions::from_config(&env.config())
}

/// Clone the first half of the origin's objects, then mount
pub fn clone_and_mount(
    env: &TestEnvironment,
    origin: &FakeOrigin,
    name: &str,
) -> (Enlistment, MountSession) {
    let enlistment = Enlistment::new(env.enlistment_root(name));
    let opts = options(env);
    let ids = origin.ids();
    clone(ORIGIN, &enlistment, &opts, origin, &ids[..ids.len() / 2]).unwrap();
    let session = prepare(&enlistment, &opts).unwrap();
    (enlistment, session)
}

/// Read every object through the session, as a full checkout would
pub fn hydrate_all(session: &MountSession, origin: &FakeOrigin) {
    for (oid, body) in &origin.objects {
        assert_eq!(&session.hydrate(oid, origin).unwrap(), body);
    }
}

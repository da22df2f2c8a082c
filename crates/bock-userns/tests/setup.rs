//! End-to-end user namespace setup.

use std::path::Path;

use bock_common::BockError;
use bock_userns::{
    IdMapEntry, Invoker, NamespaceMode, UsernsConfig, UsernsManager, UsernsOptions, UsernsSetup,
};
use tempfile::{TempDir, tempdir};

const ALICE_UID: u32 = 1000;
const ALICE_GID: u32 = 1001;

fn manager(temp: &TempDir) -> UsernsManager {
    write(temp.path(), "subuid", "# comment\nalice:100000:65536\ncarol:300000:5000\n");
    write(temp.path(), "subgid", "alice:200000:65536\ncarol:400000:5000\n");
    let config = UsernsConfig::default()
        .with_root(temp.path().join("root"))
        .with_subid_files(temp.path().join("subuid"), temp.path().join("subgid"));
    UsernsManager::new(config, Invoker::new(ALICE_UID, ALICE_GID, "alice"))
}

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

fn setup(manager: &UsernsManager, userns: &str, user: Option<&str>) -> UsernsSetup {
    manager
        .setup(&UsernsOptions {
            userns: Some(userns.to_string()),
            user: user.map(str::to_string),
            ..Default::default()
        })
        .unwrap()
}

fn span(entries: &[IdMapEntry]) -> u64 {
    entries.iter().map(IdMapEntry::container_end).max().unwrap()
}

#[test]
fn auto_honours_requested_size() {
    let temp = tempdir().unwrap();
    let manager = manager(&temp);

    let small = setup(&manager, "auto:size=500", None);
    assert_eq!(small.uid_map.entries(), &[IdMapEntry::new(0, 100_000, 500)]);

    let large = setup(&manager, "auto:size=3000", None);
    assert_eq!(large.uid_map.entries(), &[IdMapEntry::new(0, 100_500, 3000)]);
    assert_eq!(large.gid_map.entries(), &[IdMapEntry::new(0, 200_500, 3000)]);
}

#[test]
fn auto_grows_to_cover_user() {
    let temp = tempdir().unwrap();
    let manager = manager(&temp);

    let first = setup(&manager, "auto", Some("2000:3000"));
    assert!(span(first.uid_map.entries()) >= 3001);

    let second = setup(&manager, "auto", Some("4000:1000"));
    assert!(span(second.uid_map.entries()) >= 4001);
    assert!(span(second.gid_map.entries()) >= 4001);
}

#[test]
fn auto_places_custom_mappings_first() {
    let temp = tempdir().unwrap();
    let manager = manager(&temp);

    let custom = setup(&manager, "auto:uidmapping=0:0:1", None);
    let entries = custom.uid_map.entries();
    assert_eq!(entries[0], IdMapEntry::new(0, 0, 1));
    assert_eq!(entries[1], IdMapEntry::new(1, 100_000, 1023));

    let sized = setup(&manager, "auto:size=8192,uidmapping=0:0:1", None);
    assert_eq!(sized.uid_map.entries()[0], IdMapEntry::new(0, 0, 1));
    assert_eq!(span(sized.uid_map.entries()), 8192);
    assert!(sized.uid_map.host_id_of(8191).is_some());
    assert!(sized.uid_map.host_id_of(8192).is_none());
}

#[test]
fn keep_id_maps_invoker_to_itself() {
    let temp = tempdir().unwrap();
    let manager = manager(&temp);

    let kept = setup(&manager, "keep-id", None);
    assert_eq!(kept.uid_map.host_id_of(ALICE_UID), Some(ALICE_UID));
    assert_eq!(kept.gid_map.host_id_of(ALICE_GID), Some(ALICE_GID));
    assert_eq!(kept.uid_map.host_id_of(0), Some(100_000));
    assert!(kept.lease.is_some());
}

#[test]
fn keep_id_honours_overrides() {
    let temp = tempdir().unwrap();
    let manager = manager(&temp);

    let kept = setup(&manager, "keep-id:uid=10,gid=12", None);
    assert_eq!(kept.uid_map.host_id_of(10), Some(ALICE_UID));
    assert_eq!(kept.gid_map.host_id_of(12), Some(ALICE_GID));
    assert_ne!(kept.uid_map.host_id_of(0), Some(ALICE_UID));
}

#[test]
fn mixed_sources_are_rejected_before_allocation() {
    let temp = tempdir().unwrap();
    let manager = manager(&temp);

    let host = manager.setup(&UsernsOptions {
        userns: Some("host".to_string()),
        uid_map: vec!["0:1:500".to_string()],
        gid_map: vec!["0:1:500".to_string()],
        ..Default::default()
    });
    assert!(matches!(host, Err(BockError::Conflict { .. })));

    let private = manager.setup(&UsernsOptions {
        userns: Some("private".to_string()),
        sub_uid_name: Some("carol".to_string()),
        ..Default::default()
    });
    assert!(matches!(private, Err(BockError::Conflict { .. })));

    assert!(manager.leases().unwrap().is_empty());
}

#[test]
fn explicit_maps_pass_through() {
    let temp = tempdir().unwrap();
    let manager = manager(&temp);

    let explicit = manager
        .setup(&UsernsOptions {
            uid_map: vec!["0:100000:1000,2000:300000:10".to_string()],
            ..Default::default()
        })
        .unwrap();
    let expected = [
        IdMapEntry::new(0, 100_000, 1000),
        IdMapEntry::new(2000, 300_000, 10),
    ];
    assert_eq!(explicit.mode, NamespaceMode::New);
    assert_eq!(explicit.uid_map.entries(), &expected);
    assert_eq!(explicit.gid_map.entries(), &expected);
    assert!(explicit.lease.is_none());
}

#[test]
fn named_pool_lays_out_from_zero() {
    let temp = tempdir().unwrap();
    let manager = manager(&temp);

    let named = manager
        .setup(&UsernsOptions {
            sub_uid_name: Some("carol".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(named.uid_map.entries(), &[IdMapEntry::new(0, 300_000, 5000)]);
    assert_eq!(named.gid_map.entries(), &[IdMapEntry::new(0, 400_000, 5000)]);
}

#[test]
fn host_and_join() {
    let temp = tempdir().unwrap();
    let manager = manager(&temp);

    let host = setup(&manager, "host", None);
    assert_eq!(host.mode, NamespaceMode::Host);
    assert!(host.uid_map.is_empty() && host.gid_map.is_empty());

    let host_join = manager.setup(&UsernsOptions {
        userns: Some(format!("container:{}", host.container)),
        ..Default::default()
    });
    assert!(matches!(host_join, Err(BockError::NamespaceNotFound { .. })));

    let owner = setup(&manager, "auto", None);
    let joined = setup(&manager, &format!("container:{}", owner.container), None);
    assert!(matches!(joined.mode, NamespaceMode::Join { .. }));
    assert_eq!(joined.uid_map, owner.uid_map);
    assert_eq!(joined.gid_map, owner.gid_map);

    let missing = manager.setup(&UsernsOptions {
        userns: Some("container:nobody".to_string()),
        ..Default::default()
    });
    assert!(matches!(missing, Err(BockError::ContainerNotFound { .. })));
}

#[test]
fn release_is_idempotent() {
    let temp = tempdir().unwrap();
    let manager = manager(&temp);

    let first = setup(&manager, "auto", None);
    let second = setup(&manager, "auto", None);
    let lease = first.lease.unwrap();

    assert_eq!(manager.release(&lease).unwrap(), 2);
    assert_eq!(manager.release(&lease).unwrap(), 0);
    assert_eq!(manager.release(&bock_common::LeaseId::generate()).unwrap(), 0);

    let left = manager.leases().unwrap();
    assert_eq!(left.len(), 2);
    assert!(left.iter().all(|r| Some(&r.lease) == second.lease.as_ref()));
}

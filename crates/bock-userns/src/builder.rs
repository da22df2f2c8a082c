//! Turning a parsed request and its host ranges into UID/GID maps.

use bock_common::{BockError, BockResult};

use crate::allocator::DEFAULT_AUTO_SIZE;
use crate::idmap::{IdKind, IdMap, IdMapEntry, UsernsMaps};
use crate::parser::{AutoOptions, ExplicitMaps, KeepIdOptions, UserSpec};
use crate::subid::{IdRange, IdRangePool, Invoker, PoolReader};

/// Smallest range `auto` may allocate: every container ID referenced by
/// `--user` or a custom mapping has to fall inside it.
#[must_use]
pub fn auto_minimum(opts: &AutoOptions, user: Option<&UserSpec>) -> u32 {
    let user_span = user
        .and_then(UserSpec::highest_id)
        .map_or(0, |id| u64::from(id) + 1);
    let custom_span = opts
        .uid_mapping
        .iter()
        .chain(&opts.gid_mapping)
        .map(IdMapEntry::container_end)
        .max()
        .unwrap_or(0);

    saturate(user_span.max(custom_span))
}

/// Length of the filler range `keep-id` reserves: the larger of the default
/// size and the highest referenced container ID plus one.
#[must_use]
pub fn keep_id_length(opts: &KeepIdOptions, invoker: &Invoker, user: Option<&UserSpec>) -> u32 {
    let highest = [
        Some(opts.uid.unwrap_or(invoker.uid)),
        Some(opts.gid.unwrap_or(invoker.gid)),
        user.and_then(UserSpec::highest_id),
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(0);

    saturate((u64::from(highest) + 1).max(u64::from(DEFAULT_AUTO_SIZE)))
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Maps for `auto`: custom entries first, then the allocated range spread
/// over every container ID of `[0, length)` the custom entries leave free.
///
/// # Errors
///
/// [`BockError::Overlap`] when custom entries cover a container ID twice,
/// [`BockError::HostOverlap`] when they reuse a host ID of the allocated
/// range or of each other.
pub fn build_auto(opts: &AutoOptions, uid_range: IdRange, gid_range: IdRange) -> BockResult<UsernsMaps> {
    Ok(UsernsMaps::new(
        auto_map(IdKind::Uid, &opts.uid_mapping, uid_range)?,
        auto_map(IdKind::Gid, &opts.gid_mapping, gid_range)?,
    ))
}

fn auto_map(kind: IdKind, custom: &[IdMapEntry], range: IdRange) -> BockResult<IdMap> {
    let mut map = IdMap::from(custom.to_vec());
    map.check_disjoint(kind)?;

    let mut occupied: Vec<(u64, u64)> = custom
        .iter()
        .map(|e| (u64::from(e.container_id), e.container_end()))
        .collect();
    occupied.sort_unstable();

    let limit = u64::from(range.length);
    let mut next_host = u64::from(range.start);
    let mut cursor = 0u64;
    for (start, end) in occupied.into_iter().chain([(limit, limit)]) {
        let gap_end = start.min(limit);
        if gap_end > cursor {
            push_span(&mut map, cursor, next_host, gap_end - cursor)?;
            next_host += gap_end - cursor;
        }
        cursor = cursor.max(end);
    }

    map.check_host_disjoint(kind)?;
    Ok(map)
}

fn push_span(map: &mut IdMap, container: u64, host: u64, size: u64) -> BockResult<()> {
    let narrow = |v: u64| {
        u32::try_from(v).map_err(|_| BockError::Internal {
            message: format!("ID {v} does not fit in 32 bits"),
        })
    };
    map.push(IdMapEntry::new(narrow(container)?, narrow(host)?, narrow(size)?));
    Ok(())
}

/// Maps for `keep-id`: the invoker's own UID/GID at the requested container
/// IDs (its own IDs by default), every other container ID of
/// `[0, length + 1)` backed by the allocated range.
///
/// # Errors
///
/// Only on internal arithmetic failures.
pub fn build_keep_id(
    opts: &KeepIdOptions,
    invoker: &Invoker,
    uid_range: IdRange,
    gid_range: IdRange,
) -> BockResult<UsernsMaps> {
    Ok(UsernsMaps::new(
        keep_id_map(opts.uid.unwrap_or(invoker.uid), invoker.uid, uid_range)?,
        keep_id_map(opts.gid.unwrap_or(invoker.gid), invoker.gid, gid_range)?,
    ))
}

fn keep_id_map(target: u32, own: u32, range: IdRange) -> BockResult<IdMap> {
    let target64 = u64::from(target);
    let length = u64::from(range.length);
    let start = u64::from(range.start);

    let mut map = IdMap::new();
    let below = target64.min(length);
    push_span(&mut map, 0, start, below)?;
    map.push(IdMapEntry::new(target, own, 1));
    if length > below {
        push_span(&mut map, target64 + 1, start + below, length - below)?;
    }
    Ok(map)
}

/// Maps from `--uidmap`/`--gidmap`/`--subuidname`/`--subgidname`.
///
/// A map given for one kind only is reused for the other, as is a pool name.
/// Pool-derived entries are laid out from container ID 0 after any explicit
/// entries.
///
/// # Errors
///
/// [`BockError::PoolNotFound`] for an unknown pool name,
/// [`BockError::Overlap`] when container IDs are covered twice.
pub fn build_explicit(maps: &ExplicitMaps, pools: &PoolReader) -> BockResult<UsernsMaps> {
    let (uid_entries, gid_entries) = match (maps.uid_map.is_empty(), maps.gid_map.is_empty()) {
        (false, true) => (&maps.uid_map, &maps.uid_map),
        (true, false) => (&maps.gid_map, &maps.gid_map),
        _ => (&maps.uid_map, &maps.gid_map),
    };
    let uid_name = maps.sub_uid_name.as_ref().or(maps.sub_gid_name.as_ref());
    let gid_name = maps.sub_gid_name.as_ref().or(maps.sub_uid_name.as_ref());

    let mut result = UsernsMaps::default();
    for (kind, entries, name) in [
        (IdKind::Uid, uid_entries, uid_name),
        (IdKind::Gid, gid_entries, gid_name),
    ] {
        let mut map = IdMap::from(entries.clone());
        if let Some(name) = name {
            for entry in pool_layout(pools.pool(kind, name)?.as_ref(), 0) {
                map.push(entry);
            }
        }
        map.check_disjoint(kind)?;

        match kind {
            IdKind::Uid => result.uid_map = map,
            IdKind::Gid => result.gid_map = map,
        }
    }

    Ok(result)
}

/// Maps for a plain private namespace.
///
/// The superuser gets no remapping; anyone else is root inside, backed by
/// their own ID, with their whole subordinate pool from container ID 1.
#[must_use]
pub fn build_private(invoker: &Invoker, pools: &PoolReader) -> UsernsMaps {
    if invoker.is_superuser() {
        return UsernsMaps::default();
    }

    let mut result = UsernsMaps::default();
    for (kind, own) in [(IdKind::Uid, invoker.uid), (IdKind::Gid, invoker.gid)] {
        let mut map = IdMap::new();
        map.push(IdMapEntry::new(0, own, 1));
        match pools.pool_for(kind, invoker) {
            Ok(pool) => {
                for entry in pool_layout(pool.as_ref(), 1) {
                    map.push(entry);
                }
            }
            Err(err) => tracing::debug!(%err, "No subordinate pool; mapping only the invoker"),
        }

        match kind {
            IdKind::Uid => result.uid_map = map,
            IdKind::Gid => result.gid_map = map,
        }
    }
    result
}

/// Lay the pool's ranges end to end from `first` in container ID space.
fn pool_layout(pool: &IdRangePool, first: u32) -> Vec<IdMapEntry> {
    let mut entries = Vec::with_capacity(pool.ranges().len());
    let mut container = u64::from(first);
    let space = u64::from(u32::MAX) + 1;

    for range in pool.ranges() {
        let size = u64::from(range.length).min(space.saturating_sub(container));
        if size == 0 {
            break;
        }
        entries.push(IdMapEntry::new(saturate(container), range.start, saturate(size)));
        container += size;
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::tempdir;

    fn alice() -> Invoker {
        Invoker::new(1000, 1000, "alice")
    }

    fn entries(map: &IdMap) -> Vec<(u32, u32, u32)> {
        map.iter()
            .map(|e| (e.container_id, e.host_id, e.size))
            .collect()
    }

    fn reader(dir: &tempfile::TempDir) -> PoolReader {
        let uid = dir.path().join("subuid");
        let gid = dir.path().join("subgid");
        fs::write(&uid, "alice:100000:65536\ncontainers:500000:1000\n").unwrap();
        fs::write(&gid, "alice:200000:65536\n").unwrap();
        PoolReader::new(uid, gid)
    }

    #[test]
    fn auto_default_is_single_entry() {
        let maps = build_auto(
            &AutoOptions::default(),
            IdRange::new(100_000, 1024),
            IdRange::new(200_000, 1024),
        )
        .unwrap();
        assert_eq!(entries(&maps.uid_map), vec![(0, 100_000, 1024)]);
        assert_eq!(entries(&maps.gid_map), vec![(0, 200_000, 1024)]);
    }

    #[test]
    fn auto_custom_prefix_and_filler() {
        let opts = AutoOptions {
            size: Some(8192),
            uid_mapping: vec![IdMapEntry::new(0, 0, 1)],
            ..Default::default()
        };
        let maps = build_auto(&opts, IdRange::new(100_000, 8192), IdRange::new(200_000, 8192))
            .unwrap();

        assert_eq!(
            entries(&maps.uid_map),
            vec![(0, 0, 1), (1, 100_000, 8191)]
        );
        assert_eq!(maps.uid_map.container_span(), 8192);
        assert_eq!(entries(&maps.gid_map), vec![(0, 200_000, 8192)]);
    }

    #[test]
    fn auto_custom_in_the_middle_fills_both_gaps() {
        let opts = AutoOptions {
            gid_mapping: vec![IdMapEntry::new(10, 5, 2), IdMapEntry::new(20, 7, 1)],
            ..Default::default()
        };
        let maps = build_auto(&opts, IdRange::new(0, 1024), IdRange::new(300, 100)).unwrap();

        assert_eq!(
            entries(&maps.gid_map),
            vec![
                (10, 5, 2),
                (20, 7, 1),
                (0, 300, 10),
                (12, 310, 8),
                (21, 318, 79),
            ]
        );
        let filler: u32 = maps.gid_map.iter().skip(2).map(|e| e.size).sum();
        assert_eq!(filler, 100 - 3);
        assert!(maps.gid_map.check_disjoint(IdKind::Gid).is_ok());
    }

    #[test]
    fn auto_custom_overlap_fails() {
        let opts = AutoOptions {
            uid_mapping: vec![IdMapEntry::new(0, 0, 10), IdMapEntry::new(5, 50, 1)],
            ..Default::default()
        };
        let err = build_auto(&opts, IdRange::new(0, 1024), IdRange::new(0, 1024)).unwrap_err();
        assert!(matches!(err, BockError::Overlap { .. }));
    }

    #[test]
    fn auto_custom_host_ids_must_stay_outside_the_range() {
        let opts = AutoOptions {
            uid_mapping: vec![IdMapEntry::new(0, 100_000, 1)],
            ..Default::default()
        };
        let err = build_auto(&opts, IdRange::new(100_000, 1024), IdRange::new(200_000, 1024))
            .unwrap_err();
        assert!(matches!(
            err,
            BockError::HostOverlap { ref kind, host_id: 100_000 } if kind == "uid"
        ));

        let opts = AutoOptions {
            gid_mapping: vec![IdMapEntry::new(0, 5, 10), IdMapEntry::new(10, 9, 1)],
            ..Default::default()
        };
        let err = build_auto(&opts, IdRange::new(100_000, 1024), IdRange::new(200_000, 1024))
            .unwrap_err();
        assert!(matches!(err, BockError::HostOverlap { host_id: 9, .. }));
    }

    #[test]
    fn minimum_size_inference() {
        let opts = AutoOptions::default();
        let user: UserSpec = "2000:3000".parse().unwrap();
        assert_eq!(auto_minimum(&opts, Some(&user)), 3001);

        let user: UserSpec = "4000:1000".parse().unwrap();
        assert_eq!(auto_minimum(&opts, Some(&user)), 4001);

        let opts = AutoOptions {
            uid_mapping: vec![IdMapEntry::new(0, 0, 5000)],
            ..Default::default()
        };
        assert_eq!(auto_minimum(&opts, None), 5000);
        assert_eq!(auto_minimum(&AutoOptions::default(), None), 0);
    }

    #[test]
    fn keep_id_maps_own_ids_in_place() {
        let opts = KeepIdOptions::default();
        let length = keep_id_length(&opts, &alice(), None);
        assert_eq!(length, 1024);

        let maps = build_keep_id(
            &opts,
            &alice(),
            IdRange::new(100_000, length),
            IdRange::new(200_000, length),
        )
        .unwrap();

        assert_eq!(maps.uid_map.host_id_of(1000), Some(1000));
        assert_eq!(maps.gid_map.host_id_of(1000), Some(1000));
        assert_eq!(maps.uid_map.host_id_of(0), Some(100_000));
        assert_eq!(
            entries(&maps.uid_map),
            vec![(0, 100_000, 1000), (1000, 1000, 1), (1001, 101_000, 24)]
        );
        assert!(maps.uid_map.check_disjoint(IdKind::Uid).is_ok());
    }

    #[test]
    fn keep_id_with_explicit_targets() {
        let opts = KeepIdOptions {
            uid: Some(10),
            gid: Some(12),
        };
        let maps = build_keep_id(
            &opts,
            &alice(),
            IdRange::new(100_000, 1024),
            IdRange::new(200_000, 1024),
        )
        .unwrap();

        assert_eq!(maps.uid_map.host_id_of(10), Some(1000));
        assert_eq!(maps.gid_map.host_id_of(12), Some(1000));
        assert_eq!(
            entries(&maps.uid_map),
            vec![(0, 100_000, 10), (10, 1000, 1), (11, 100_010, 1014)]
        );
    }

    #[test]
    fn keep_id_length_covers_high_ids() {
        let invoker = Invoker::new(5000, 5000, "bob");
        assert_eq!(keep_id_length(&KeepIdOptions::default(), &invoker, None), 5001);

        let user: UserSpec = "7000".parse().unwrap();
        assert_eq!(
            keep_id_length(&KeepIdOptions::default(), &alice(), Some(&user)),
            7001
        );

        let maps = build_keep_id(
            &KeepIdOptions::default(),
            &invoker,
            IdRange::new(100_000, 5001),
            IdRange::new(200_000, 5001),
        )
        .unwrap();
        assert_eq!(
            entries(&maps.uid_map),
            vec![(0, 100_000, 5000), (5000, 5000, 1), (5001, 105_000, 1)]
        );
    }

    #[test]
    fn explicit_reuses_single_map() {
        let temp = tempdir().unwrap();
        let maps = ExplicitMaps {
            uid_map: vec![IdMapEntry::new(0, 0, 1), IdMapEntry::new(1, 1, 4998)],
            ..Default::default()
        };
        let built = build_explicit(&maps, &reader(&temp)).unwrap();
        assert_eq!(built.uid_map, built.gid_map);
        assert_eq!(entries(&built.uid_map), vec![(0, 0, 1), (1, 1, 4998)]);
    }

    #[test]
    fn explicit_overlap_fails() {
        let temp = tempdir().unwrap();
        let maps = ExplicitMaps {
            uid_map: vec![IdMapEntry::new(0, 100, 5000)],
            gid_map: vec![IdMapEntry::new(0, 200, 10), IdMapEntry::new(9, 300, 10)],
            ..Default::default()
        };
        let err = build_explicit(&maps, &reader(&temp)).unwrap_err();
        assert!(matches!(err, BockError::Overlap { ref kind, container_id: 9 } if kind == "gid"));
    }

    #[test]
    fn explicit_from_pool_names() {
        let temp = tempdir().unwrap();
        let maps = ExplicitMaps {
            sub_uid_name: Some("alice".into()),
            ..Default::default()
        };
        let built = build_explicit(&maps, &reader(&temp)).unwrap();
        assert_eq!(entries(&built.uid_map), vec![(0, 100_000, 65536)]);
        assert_eq!(entries(&built.gid_map), vec![(0, 200_000, 65536)]);

        let maps = ExplicitMaps {
            sub_gid_name: Some("containers".into()),
            ..Default::default()
        };
        let err = build_explicit(&maps, &reader(&temp)).unwrap_err();
        assert!(matches!(err, BockError::PoolNotFound { .. }));
    }

    #[test]
    fn private_layout() {
        let temp = tempdir().unwrap();
        let pools = reader(&temp);

        let maps = build_private(&alice(), &pools);
        assert_eq!(
            entries(&maps.uid_map),
            vec![(0, 1000, 1), (1, 100_000, 65536)]
        );

        assert!(build_private(&Invoker::new(0, 0, "root"), &pools).is_identity());

        let stranger = Invoker::new(2000, 2000, "carol");
        let maps = build_private(&stranger, &pools);
        assert_eq!(entries(&maps.gid_map), vec![(0, 2000, 1)]);
    }

    fn disjoint_entries() -> impl Strategy<Value = Vec<IdMapEntry>> {
        prop::collection::vec((0u32..1000, 0u32..1_000_000, 1u32..1000), 1..8).prop_map(|spans| {
            let mut container = 0u32;
            spans
                .into_iter()
                .map(|(gap, host, size)| {
                    let entry = IdMapEntry::new(container + gap, host, size);
                    container += gap + size;
                    entry
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn explicit_round_trip(uid in disjoint_entries(), gid in disjoint_entries()) {
            let temp = tempdir().unwrap();
            let maps = ExplicitMaps {
                uid_map: uid.clone(),
                gid_map: gid.clone(),
                ..Default::default()
            };
            let built = build_explicit(&maps, &reader(&temp)).unwrap();
            prop_assert_eq!(built.uid_map.entries(), uid.as_slice());
            prop_assert_eq!(built.gid_map.entries(), gid.as_slice());
        }
    }
}

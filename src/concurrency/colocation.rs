//! Commit-time host resolution.

use std::collections::{BTreeSet, HashMap};

use crate::distribution::MemberId;
use crate::region::{Host, RegionKind, RegionStore};
use crate::transaction::{Result, TransactionError, WriteSet};

/// The member that will run a commit, plus the kinds of the regions touched.
#[derive(Debug)]
pub struct HostAssignment {
    pub host: MemberId,
    pub kinds: HashMap<String, RegionKind>,
}

/// Resolves one host for every written key.
///
/// Partitioned keys pin the host to their bucket primary; replicated and
/// persistent keys fit on any member. With no partitioned keys the local
/// member hosts the commit.
pub fn resolve_host(store: &dyn RegionStore, write_set: &WriteSet) -> Result<HostAssignment> {
    let mut kinds: HashMap<String, RegionKind> = HashMap::new();
    let mut hosts = BTreeSet::new();

    for (key, _) in write_set.written() {
        if !kinds.contains_key(&key.region) {
            kinds.insert(key.region.clone(), store.region_kind(&key.region)?);
        }
        let kind = &kinds[&key.region];
        if let Host::Member(member) = kind.resolve_host(store, &key.region, &key.key)? {
            hosts.insert(member);
        }
    }

    if hosts.len() > 1 {
        return Err(TransactionError::NotColocated {
            members: hosts.into_iter().collect(),
        });
    }

    Ok(HostAssignment {
        host: hosts
            .into_iter()
            .next()
            .unwrap_or_else(|| store.local_member()),
        kinds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{MemoryRegionStore, PartitionAttributes};
    use crate::region::VersionedValue;
    use crate::transaction::EntryKey;
    use bytes::Bytes;
    use std::convert::Infallible;

    fn store() -> MemoryRegionStore {
        let store = MemoryRegionStore::with_members(
            MemberId::new(1),
            vec![MemberId::new(1), MemberId::new(2)],
        );
        store
            .create_region(
                "p",
                RegionKind::Partitioned(PartitionAttributes::new(8, 0)),
            )
            .unwrap();
        store.create_region("r", RegionKind::Replicated).unwrap();
        store
    }

    fn write(ws: &mut WriteSet, region: &str, key: &str) {
        ws.write(
            EntryKey::new(region, Bytes::copy_from_slice(key.as_bytes())),
            Some(Bytes::from("v")),
            || Ok::<_, Infallible>(VersionedValue::default()),
        )
        .unwrap();
    }

    fn key_on(store: &MemoryRegionStore, member: MemberId) -> String {
        let RegionKind::Partitioned(attrs) = store.region_kind("p").unwrap() else {
            unreachable!()
        };
        (0..)
            .map(|i| format!("k{}", i))
            .find(|k| {
                let bucket = attrs.bucket_id(&Bytes::copy_from_slice(k.as_bytes()));
                store.bucket_owners("p", bucket).unwrap().primary == member
            })
            .unwrap()
    }

    #[test]
    fn test_replicated_only_is_hosted_locally() {
        let store = store();
        let mut ws = WriteSet::new();
        write(&mut ws, "r", "a");
        write(&mut ws, "r", "b");

        let assignment = resolve_host(&store, &ws).unwrap();
        assert_eq!(assignment.host, MemberId::new(1));
    }

    #[test]
    fn test_partitioned_key_picks_its_primary() {
        let store = store();
        let remote = key_on(&store, MemberId::new(2));
        let mut ws = WriteSet::new();
        write(&mut ws, "r", "a");
        write(&mut ws, "p", &remote);

        let assignment = resolve_host(&store, &ws).unwrap();
        assert_eq!(assignment.host, MemberId::new(2));
        assert_eq!(assignment.kinds.len(), 2);
    }

    #[test]
    fn test_two_primaries_are_not_colocated() {
        let store = store();
        let mut ws = WriteSet::new();
        write(&mut ws, "p", &key_on(&store, MemberId::new(1)));
        write(&mut ws, "p", &key_on(&store, MemberId::new(2)));

        match resolve_host(&store, &ws) {
            Err(TransactionError::NotColocated { members }) => {
                assert_eq!(members, vec![MemberId::new(1), MemberId::new(2)]);
            }
            other => panic!("expected NotColocated, got {:?}", other),
        }
    }

    #[test]
    fn test_reads_do_not_count() {
        let store = store();
        let mut ws = WriteSet::new();
        write(&mut ws, "p", &key_on(&store, MemberId::new(2)));
        let other = EntryKey::new(
            "p",
            Bytes::copy_from_slice(key_on(&store, MemberId::new(1)).as_bytes()),
        );
        ws.read(&other, || Ok::<_, Infallible>(VersionedValue::default()))
            .unwrap();

        assert_eq!(resolve_host(&store, &ws).unwrap().host, MemberId::new(2));
    }
}

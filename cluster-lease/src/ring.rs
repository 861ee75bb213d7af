use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::{Error, HashFunction, KeyHasher, Member, ResourceMapper, DEFAULT_VNODES};

/// Consistent hash ring with virtual nodes.
///
/// Each member is placed at `vnodes` points on a 64-bit ring, at
/// `hash("{name}:{replica}")`. A resource belongs to the first point at or
/// after its own hash, wrapping around to the lowest point.
///
/// Provides:
/// - Minimal disruption: removing a member only moves the resources that sat
///   on its arcs, adding one only moves resources that fall into its new arcs
/// - Lookups in O(log(members * vnodes))
/// - Deterministic placement for a given member set and hasher
#[derive(Clone)]
pub struct HashRing {
    ring: BTreeMap<u64, Member>,
    members: BTreeSet<Member>,
    hasher: Arc<dyn KeyHasher>,
    vnodes: usize,
}

impl HashRing {
    /// Ring with the default hasher and [`DEFAULT_VNODES`] points per member.
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        Self::with_hasher(members, Arc::new(HashFunction::default()), DEFAULT_VNODES)
    }

    /// A `vnodes` of zero is treated as one, so every member keeps at least
    /// one point on the ring.
    pub fn with_hasher(
        members: impl IntoIterator<Item = Member>,
        hasher: Arc<dyn KeyHasher>,
        vnodes: usize,
    ) -> Self {
        let members: BTreeSet<Member> = members.into_iter().collect();
        let vnodes = vnodes.max(1);

        // Members are visited in sorted order so a vnode collision always
        // resolves to the same member.
        let mut ring = BTreeMap::new();
        for member in &members {
            for replica in 0..vnodes {
                let key = format!("{}:{}", member.name, replica);
                let hash = hasher.hash(key.as_bytes());
                ring.entry(hash).or_insert_with(|| member.clone());
            }
        }

        Self {
            ring,
            members,
            hasher,
            vnodes,
        }
    }

    /// Get the number of members in the ring.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &BTreeSet<Member> {
        &self.members
    }

    pub fn vnodes(&self) -> usize {
        self.vnodes
    }

    /// Number of distinct points on the ring.
    pub fn point_count(&self) -> usize {
        self.ring.len()
    }
}

impl ResourceMapper for HashRing {
    fn owner(&self, resource_id: &str) -> Result<Member, Error> {
        let hash = self.hasher.hash(resource_id.as_bytes());
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, member)| member.clone())
            .ok_or_else(|| Error::no_members(resource_id))
    }
}

impl fmt::Debug for HashRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashRing")
            .field("members", &self.members)
            .field("vnodes", &self.vnodes)
            .field("hasher", &self.hasher)
            .finish()
    }
}

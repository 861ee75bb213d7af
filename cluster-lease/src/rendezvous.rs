use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    Error, HashFunction, KeyHasher, Member, ResourceMapper, DEFAULT_RENDEZVOUS_CACHE_CAPACITY,
    DEFAULT_RENDEZVOUS_CACHE_TTL,
};

struct CacheEntry {
    member: Member,
    expires_at: Instant,
}

/// Rendezvous (highest random weight) hashing.
///
/// A resource belongs to the member with the largest `hash(name, resource)`.
/// Lookups are O(members), so results are memoized in an access-expiring
/// cache keyed by resource id. The cache is only valid for this member set;
/// a membership change builds a new mapper with an empty cache.
pub struct RendezvousMapper {
    members: Vec<Member>,
    hasher: Arc<dyn KeyHasher>,
    cache: DashMap<String, CacheEntry>,
    cache_ttl: Duration,
    cache_capacity: usize,
}

impl RendezvousMapper {
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        Self::with_hasher(
            members,
            Arc::new(HashFunction::default()),
            DEFAULT_RENDEZVOUS_CACHE_TTL,
            DEFAULT_RENDEZVOUS_CACHE_CAPACITY,
        )
    }

    /// A `cache_capacity` of zero disables memoization.
    pub fn with_hasher(
        members: impl IntoIterator<Item = Member>,
        hasher: Arc<dyn KeyHasher>,
        cache_ttl: Duration,
        cache_capacity: usize,
    ) -> Self {
        let members: BTreeSet<Member> = members.into_iter().collect();
        Self {
            members: members.into_iter().collect(),
            hasher,
            cache: DashMap::new(),
            cache_ttl,
            cache_capacity,
        }
    }

    /// Members in sorted order, duplicates removed.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn owner_at(&self, resource_id: &str, now: Instant) -> Result<Member, Error> {
        if let Some(mut entry) = self.cache.get_mut(resource_id) {
            if entry.expires_at > now {
                entry.expires_at = now + self.cache_ttl;
                return Ok(entry.member.clone());
            }
        }

        let member = self
            .members
            .iter()
            .map(|member| (self.weight(member, resource_id), member))
            .max()
            .map(|(_, member)| member.clone())
            .ok_or_else(|| Error::no_members(resource_id))?;

        if self.cache_capacity > 0 {
            self.make_room(resource_id, now);
            self.cache.insert(
                resource_id.to_string(),
                CacheEntry {
                    member: member.clone(),
                    expires_at: now + self.cache_ttl,
                },
            );
        }

        Ok(member)
    }

    fn make_room(&self, resource_id: &str, now: Instant) {
        if self.cache.len() < self.cache_capacity || self.cache.contains_key(resource_id) {
            return;
        }
        self.cache.retain(|_, entry| entry.expires_at > now);
        if self.cache.len() >= self.cache_capacity {
            tracing::debug!(
                capacity = self.cache_capacity,
                "Rendezvous cache full of live entries, clearing"
            );
            self.cache.clear();
        }
    }

    fn weight(&self, member: &Member, resource_id: &str) -> u64 {
        let mut key = Vec::with_capacity(member.name.len() + 1 + resource_id.len());
        key.extend_from_slice(member.name.as_bytes());
        key.push(0);
        key.extend_from_slice(resource_id.as_bytes());
        self.hasher.hash(&key)
    }
}

impl ResourceMapper for RendezvousMapper {
    fn owner(&self, resource_id: &str) -> Result<Member, Error> {
        self.owner_at(resource_id, Instant::now())
    }
}

impl fmt::Debug for RendezvousMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousMapper")
            .field("members", &self.members)
            .field("hasher", &self.hasher)
            .field("cache_ttl", &self.cache_ttl)
            .field("cache_len", &self.cache.len())
            .finish()
    }
}

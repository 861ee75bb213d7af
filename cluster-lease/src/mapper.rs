use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, HashFunction, HashRing, Member, RendezvousMapper};

pub const DEFAULT_VNODES: usize = 16;
pub const DEFAULT_RENDEZVOUS_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_RENDEZVOUS_CACHE_CAPACITY: usize = 10_000;

/// Maps a resource id to the member that owns it.
pub trait ResourceMapper: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// Returns [`Error::NoMembersAvailable`] when there is nobody to own the
    /// resource.
    fn owner(&self, resource_id: &str) -> Result<Member, Error>;
}

/// Builds the mapper bound to a freshly computed ready set.
pub trait MapperFactory: Send + Sync {
    fn build(&self, members: &BTreeSet<Member>) -> Arc<dyn ResourceMapper>;
}

/// Production mapping strategies.
#[derive(Debug, Clone, PartialEq)]
pub enum MapperStrategy {
    HashRing {
        vnodes: usize,
        hash: HashFunction,
    },
    Rendezvous {
        hash: HashFunction,
        cache_ttl: Duration,
        cache_capacity: usize,
    },
}

impl MapperStrategy {
    pub fn hash_ring() -> Self {
        Self::HashRing {
            vnodes: DEFAULT_VNODES,
            hash: HashFunction::default(),
        }
    }

    pub fn rendezvous() -> Self {
        Self::Rendezvous {
            hash: HashFunction::default(),
            cache_ttl: DEFAULT_RENDEZVOUS_CACHE_TTL,
            cache_capacity: DEFAULT_RENDEZVOUS_CACHE_CAPACITY,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::HashRing { .. } => "ring",
            Self::Rendezvous { .. } => "rendezvous",
        }
    }
}

impl Default for MapperStrategy {
    fn default() -> Self {
        Self::hash_ring()
    }
}

impl MapperFactory for MapperStrategy {
    fn build(&self, members: &BTreeSet<Member>) -> Arc<dyn ResourceMapper> {
        match self {
            Self::HashRing { vnodes, hash } => Arc::new(HashRing::with_hasher(
                members.iter().cloned(),
                Arc::new(*hash),
                *vnodes,
            )),
            Self::Rendezvous {
                hash,
                cache_ttl,
                cache_capacity,
            } => Arc::new(RendezvousMapper::with_hasher(
                members.iter().cloned(),
                Arc::new(*hash),
                *cache_ttl,
                *cache_capacity,
            )),
        }
    }
}

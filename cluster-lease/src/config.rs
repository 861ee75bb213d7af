use std::env;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::{
    ClusterWeight, Error, HashFunction, MapperStrategy, Member, DEFAULT_RENDEZVOUS_CACHE_CAPACITY,
    DEFAULT_RENDEZVOUS_CACHE_TTL, DEFAULT_VNODES,
};

pub const DEFAULT_SELF_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_LEASE_REFRESH_INTERVAL: Duration = Duration::from_millis(1000);

/// Which mapper the process builds for each snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MapperKind {
    #[default]
    Ring,
    Rendezvous,
}

impl MapperKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ring => "ring",
            Self::Rendezvous => "rendezvous",
        }
    }
}

impl FromStr for MapperKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ring" | "hashring" => Ok(Self::Ring),
            "rendezvous" | "hrw" => Ok(Self::Rendezvous),
            other => Err(Error::Config(format!("unknown mapper: {}", other))),
        }
    }
}

/// Process-level settings, read from `CLUSTER_*` and `LEASE_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    /// Must match the name discovery reports for this process; ownership is
    /// decided by name.
    pub self_name: String,
    /// Informational. A discovered member with this process's name counts as
    /// self whatever its address.
    pub self_address: String,
    pub mapper: MapperKind,
    pub vnodes: usize,
    pub hash: HashFunction,
    pub rendezvous_cache_ttl: Duration,
    pub rendezvous_cache_capacity: usize,
    pub weight: ClusterWeight,
    pub lease_namespace: Option<String>,
    pub lease_refresh_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            self_name: default_self_name(),
            self_address: DEFAULT_SELF_ADDRESS.to_string(),
            mapper: MapperKind::default(),
            vnodes: DEFAULT_VNODES,
            hash: HashFunction::default(),
            rendezvous_cache_ttl: DEFAULT_RENDEZVOUS_CACHE_TTL,
            rendezvous_cache_capacity: DEFAULT_RENDEZVOUS_CACHE_CAPACITY,
            weight: ClusterWeight::ACTIVE,
            lease_namespace: None,
            lease_refresh_interval: DEFAULT_LEASE_REFRESH_INTERVAL,
        }
    }
}

impl ClusterConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or blank keys take their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(name) = get("CLUSTER_SELF_NAME") {
            config.self_name = name;
        }
        if let Some(address) = get("CLUSTER_SELF_ADDRESS") {
            config.self_address = address;
        }
        if let Some(mapper) = get("CLUSTER_MAPPER") {
            config.mapper = mapper.parse()?;
        }
        if let Some(vnodes) = get("CLUSTER_VNODES") {
            config.vnodes = parse("CLUSTER_VNODES", &vnodes)?;
            if config.vnodes == 0 {
                return Err(Error::Config("CLUSTER_VNODES must be at least 1".into()));
            }
        }
        if let Some(hash) = get("CLUSTER_HASH") {
            config.hash = hash.parse()?;
        }
        if let Some(seed) = get("CLUSTER_HASH_SEED") {
            let seed: u64 = parse("CLUSTER_HASH_SEED", &seed)?;
            if let HashFunction::SipHash24 { .. } = config.hash {
                config.hash = HashFunction::siphash_with_seed(seed);
            }
        }
        if let Some(ttl) = get("CLUSTER_RENDEZVOUS_CACHE_TTL_SECS") {
            config.rendezvous_cache_ttl =
                Duration::from_secs(parse("CLUSTER_RENDEZVOUS_CACHE_TTL_SECS", &ttl)?);
        }
        if let Some(capacity) = get("CLUSTER_RENDEZVOUS_CACHE_CAPACITY") {
            config.rendezvous_cache_capacity =
                parse("CLUSTER_RENDEZVOUS_CACHE_CAPACITY", &capacity)?;
        }
        if let Some(weight) = get("CLUSTER_WEIGHT") {
            config.weight = ClusterWeight::new(parse("CLUSTER_WEIGHT", &weight)?)?;
        }
        config.lease_namespace = get("LEASE_NAMESPACE");
        if let Some(interval) = get("LEASE_REFRESH_INTERVAL_MS") {
            let millis: u64 = parse("LEASE_REFRESH_INTERVAL_MS", &interval)?;
            if millis == 0 {
                return Err(Error::Config(
                    "LEASE_REFRESH_INTERVAL_MS must be at least 1".into(),
                ));
            }
            config.lease_refresh_interval = Duration::from_millis(millis);
        }

        Ok(config)
    }

    pub fn self_member(&self) -> Member {
        Member::new(self.self_name.clone(), self.self_address.clone())
    }

    pub fn mapper_strategy(&self) -> MapperStrategy {
        match self.mapper {
            MapperKind::Ring => MapperStrategy::HashRing {
                vnodes: self.vnodes,
                hash: self.hash,
            },
            MapperKind::Rendezvous => MapperStrategy::Rendezvous {
                hash: self.hash,
                cache_ttl: self.rendezvous_cache_ttl,
                cache_capacity: self.rendezvous_cache_capacity,
            },
        }
    }
}

fn default_self_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("local-{}", &id[..8])
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", key, value)))
}

//! Cluster resource ownership and local leases over consistent hashing.
//!
//! Every process in a fleet sees the same set of ready members and runs the
//! same deterministic mapper over it, so all of them agree on which member
//! owns a resource id without talking to each other. Leases build on that:
//! a lease is held by the process its name maps to.
//!
//! This crate provides:
//! - Consistent hashing via a virtual-node ring or rendezvous (highest random
//!   weight) hashing
//! - A single-writer membership controller publishing immutable snapshots
//! - Change watches with unsubscribe tokens
//! - Leases with acquire/release listeners and a cluster weight kill switch
//! - Test doubles with explicit resource placement
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use cluster_lease::{
//!     ActiveClusterWeight, ClusterMembership, LeaseCoordinator, MapperStrategy, Member,
//! };
//!
//! let me = Member::new("zork", "10.0.0.1");
//! let cluster = Arc::new(ClusterMembership::new(me.clone(), MapperStrategy::default()));
//! cluster.apply_change([me, Member::new("mork", "10.0.0.2")], []);
//!
//! let coordinator = Arc::new(LeaseCoordinator::new(cluster, Arc::new(ActiveClusterWeight)));
//! let lease = coordinator.request_lease("nightly-report");
//! if lease.check_held().unwrap_or(false) {
//!     // This process runs the report
//! }
//! ```
//!
//! Nothing here discovers members or talks to the network. Feed ready and
//! not-ready events into [`ClusterMembership::apply_change`], directly or
//! through [`spawn_membership_pump`].

pub mod config;
mod error;
mod explicit;
mod fake;
mod hasher;
mod lease;
mod mapper;
mod member;
mod membership;
mod rendezvous;
mod ring;
pub mod runtime;
mod snapshot;
mod weight;

pub use config::{ClusterConfig, MapperKind};
pub use error::{Error, ListenerError};
pub use explicit::ExplicitResourceMapper;
pub use fake::FakeCluster;
pub use hasher::{HashFunction, KeyHasher};
pub use lease::{Lease, LeaseCoordinator, LeaseListener};
pub use mapper::{
    MapperFactory, MapperStrategy, ResourceMapper, DEFAULT_RENDEZVOUS_CACHE_CAPACITY,
    DEFAULT_RENDEZVOUS_CACHE_TTL, DEFAULT_VNODES,
};
pub use member::Member;
pub use membership::{Cluster, ClusterMembership, ClusterWatch, WatchHandle};
pub use rendezvous::RendezvousMapper;
pub use ring::HashRing;
pub use runtime::{spawn_lease_refresh, spawn_membership_pump, MembershipChange};
pub use snapshot::{ClusterChanges, MembershipSnapshot};
pub use weight::{ActiveClusterWeight, AtomicClusterWeight, ClusterWeight, ClusterWeightProvider};

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::{
    Cluster, ClusterMembership, ClusterWatch, ExplicitResourceMapper, MapperFactory, Member,
    MembershipSnapshot, ResourceMapper, WatchHandle,
};

/// Every snapshot shares the one explicit mapper.
struct SharedMapper(Arc<ExplicitResourceMapper>);

impl MapperFactory for SharedMapper {
    fn build(&self, _members: &BTreeSet<Member>) -> Arc<dyn ResourceMapper> {
        self.0.clone()
    }
}

/// Test double for a cluster.
///
/// Wraps a real [`ClusterMembership`], so membership changes are serialized
/// and delivered exactly as in production, but resource ownership comes from
/// an [`ExplicitResourceMapper`] the test controls. The fake starts with
/// itself ready.
pub struct FakeCluster {
    membership: ClusterMembership,
    resource_mapper: Arc<ExplicitResourceMapper>,
}

impl FakeCluster {
    pub const SELF_NAME: &'static str = "fake-self-node";
    pub const SELF_ADDRESS: &'static str = "10.0.0.1";

    pub fn new() -> Self {
        Self::with_self(Member::new(Self::SELF_NAME, Self::SELF_ADDRESS))
    }

    pub fn with_self(self_member: Member) -> Self {
        let resource_mapper = Arc::new(ExplicitResourceMapper::new());
        let membership = ClusterMembership::with_factory(
            self_member.clone(),
            Arc::new(SharedMapper(resource_mapper.clone())),
        );
        membership.apply_change([self_member], []);

        Self {
            membership,
            resource_mapper,
        }
    }

    pub fn self_member(&self) -> &Member {
        self.membership.self_member()
    }

    pub fn resource_mapper(&self) -> &ExplicitResourceMapper {
        &self.resource_mapper
    }

    /// Feed a membership change through the real controller.
    pub fn cluster_changed<R, N>(&self, becoming_ready: R, becoming_not_ready: N) -> Arc<MembershipSnapshot>
    where
        R: IntoIterator<Item = Member>,
        N: IntoIterator<Item = Member>,
    {
        self.membership.apply_change(becoming_ready, becoming_not_ready)
    }

    pub fn sync_point<T>(&self, f: impl FnOnce() -> T) -> T {
        self.membership.sync_point(f)
    }

    /// Block until every change submitted so far has been delivered.
    pub fn sync(&self) {
        self.membership.sync_point(|| ())
    }
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster for FakeCluster {
    fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.membership.snapshot()
    }

    fn watch(&self, watch: ClusterWatch) -> WatchHandle {
        self.membership.watch(watch)
    }
}

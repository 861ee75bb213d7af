use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::{Error, Member, ResourceMapper};

/// Immutable view of the cluster at one point in time.
///
/// The mapper is bound to exactly `ready_members`; a new snapshot (and a new
/// mapper) is built for every change rather than editing this one, so a reader
/// holding an old snapshot keeps a consistent answer.
#[derive(Clone)]
pub struct MembershipSnapshot {
    self_member: Member,
    self_ready: bool,
    ready_members: BTreeSet<Member>,
    mapper: Arc<dyn ResourceMapper>,
    version: u64,
}

impl MembershipSnapshot {
    pub fn new(
        self_member: Member,
        ready_members: BTreeSet<Member>,
        mapper: Arc<dyn ResourceMapper>,
        version: u64,
    ) -> Self {
        let self_ready = ready_members
            .iter()
            .any(|member| member.name == self_member.name);
        Self {
            self_member,
            self_ready,
            ready_members,
            mapper,
            version,
        }
    }

    pub fn self_member(&self) -> &Member {
        &self.self_member
    }

    /// Whether a ready member carries this process's name.
    pub fn self_ready(&self) -> bool {
        self.self_ready
    }

    pub fn ready_members(&self) -> &BTreeSet<Member> {
        &self.ready_members
    }

    pub fn resource_mapper(&self) -> &Arc<dyn ResourceMapper> {
        &self.mapper
    }

    /// Starts at 0 and increases by one per published change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn owner(&self, resource_id: &str) -> Result<Member, Error> {
        self.mapper.owner(resource_id)
    }

    /// Whether `resource_id` is assigned to this process. Members are matched
    /// by name, so the address this process was configured with does not
    /// have to match the one discovery reports.
    pub fn is_owned_by_self(&self, resource_id: &str) -> Result<bool, Error> {
        Ok(self.owner(resource_id)?.name == self.self_member.name)
    }
}

impl fmt::Debug for MembershipSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipSnapshot")
            .field("self_member", &self.self_member)
            .field("self_ready", &self.self_ready)
            .field("ready_members", &self.ready_members)
            .field("version", &self.version)
            .finish()
    }
}

/// What a cluster watch receives: the new snapshot and the diff against the
/// one before it. The first delivery after registering has empty diffs.
#[derive(Debug, Clone)]
pub struct ClusterChanges {
    pub snapshot: Arc<MembershipSnapshot>,
    pub added: BTreeSet<Member>,
    pub removed: BTreeSet<Member>,
}

impl ClusterChanges {
    pub fn initial(snapshot: Arc<MembershipSnapshot>) -> Self {
        Self {
            snapshot,
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    pub fn has_diff(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HashRing;

    #[test]
    fn test_snapshot_self_ready_and_ownership() {
        let me = Member::new("me", "10.0.0.1");
        let peer = Member::new("peer", "10.0.0.2");
        let ready: BTreeSet<Member> = [me.clone()].into_iter().collect();

        let snapshot = MembershipSnapshot::new(
            me.clone(),
            ready.clone(),
            Arc::new(HashRing::new(ready)),
            3,
        );

        assert!(snapshot.self_ready());
        assert_eq!(snapshot.version(), 3);
        assert!(snapshot.is_owned_by_self("anything").unwrap());

        let others: BTreeSet<Member> = [peer.clone()].into_iter().collect();
        let snapshot = MembershipSnapshot::new(me, others.clone(), Arc::new(HashRing::new(others)), 4);
        assert!(!snapshot.self_ready());
        assert!(!snapshot.is_owned_by_self("anything").unwrap());
        assert_eq!(snapshot.owner("anything").unwrap(), peer);
    }

    #[test]
    fn test_self_is_matched_by_name() {
        let configured = Member::new("me", "127.0.0.1");
        let discovered = Member::new("me", "10.4.2.17");
        let ready: BTreeSet<Member> = [discovered].into_iter().collect();
        let snapshot = MembershipSnapshot::new(
            configured,
            ready.clone(),
            Arc::new(HashRing::new(ready)),
            1,
        );

        assert!(snapshot.self_ready());
        assert!(snapshot.is_owned_by_self("anything").unwrap());
        assert_eq!(
            snapshot.resource_mapper().owner("anything").unwrap().address,
            "10.4.2.17"
        );
    }

    #[test]
    fn test_snapshot_without_members_surfaces_error() {
        let me = Member::new("me", "10.0.0.1");
        let snapshot =
            MembershipSnapshot::new(me, BTreeSet::new(), Arc::new(HashRing::new(Vec::new())), 0);

        assert!(!snapshot.self_ready());
        assert!(matches!(
            snapshot.is_owned_by_self("foo"),
            Err(Error::NoMembersAvailable { .. })
        ));
    }
}

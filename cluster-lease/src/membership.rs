use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::{ClusterChanges, Error, MapperFactory, MapperStrategy, Member, MembershipSnapshot};

/// Callback invoked with every published membership change.
///
/// Watches run on the thread applying the change, one after another in
/// registration order. They must not call back into
/// [`ClusterMembership::apply_change`] or [`Cluster::watch`] on the same
/// cluster; both wait for the running delivery and would deadlock.
pub type ClusterWatch = Box<dyn Fn(&ClusterChanges) + Send + Sync>;

/// Read side of cluster membership: the current view plus change
/// notifications.
pub trait Cluster: Send + Sync {
    /// Lock-free load of the latest snapshot.
    fn snapshot(&self) -> Arc<MembershipSnapshot>;

    /// Register `watch`. It is called immediately with the current snapshot
    /// and then once for every later change, with no gaps.
    fn watch(&self, watch: ClusterWatch) -> WatchHandle;

    fn owner(&self, resource_id: &str) -> Result<Member, Error> {
        self.snapshot().owner(resource_id)
    }
}

struct WatchEntry {
    id: u64,
    active: AtomicBool,
    callback: ClusterWatch,
}

/// Copy-on-write list of watches. Delivery iterates a stable copy, so
/// unsubscribing never waits on a running delivery.
struct WatchRegistry {
    entries: ArcSwap<Vec<Arc<WatchEntry>>>,
    next_id: AtomicU64,
}

impl WatchRegistry {
    fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn register(&self, callback: ClusterWatch) -> Arc<WatchEntry> {
        let entry = Arc::new(WatchEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            callback,
        });
        self.entries.rcu(|current| {
            let mut entries = Vec::clone(current);
            entries.push(entry.clone());
            entries
        });
        entry
    }

    fn remove(&self, id: u64) {
        self.entries.rcu(|current| {
            current
                .iter()
                .filter(|entry| entry.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    fn len(&self) -> usize {
        self.entries.load().len()
    }

    fn notify(&self, changes: &ClusterChanges) {
        let entries = self.entries.load_full();
        for entry in entries.iter() {
            if entry.active.load(Ordering::Acquire) {
                Self::deliver(entry, changes);
            }
        }
    }

    fn deliver(entry: &WatchEntry, changes: &ClusterChanges) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| (entry.callback)(changes)));
        if let Err(payload) = result {
            tracing::error!(
                watch_id = entry.id,
                version = changes.snapshot.version(),
                panic = %panic_message(payload.as_ref()),
                "Cluster watch panicked"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Token returned by [`Cluster::watch`].
///
/// Dropping the handle keeps the watch registered; call
/// [`unsubscribe`](WatchHandle::unsubscribe) to stop deliveries.
pub struct WatchHandle {
    entry: Arc<WatchEntry>,
    registry: Weak<WatchRegistry>,
}

impl WatchHandle {
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    /// Stop deliveries. A delivery already running on another thread may
    /// still complete.
    pub fn unsubscribe(&self) {
        self.entry.active.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.entry.id);
        }
    }
}

/// Single-writer membership controller.
///
/// Receives ready/not-ready events, applies them one at a time, publishes a
/// fresh [`MembershipSnapshot`] through an atomic pointer swap and notifies
/// watches. Readers only ever load the pointer and never wait on a writer.
pub struct ClusterMembership {
    self_member: Member,
    factory: Arc<dyn MapperFactory>,
    snapshot: ArcSwap<MembershipSnapshot>,
    writer: Mutex<()>,
    watches: Arc<WatchRegistry>,
}

impl ClusterMembership {
    pub fn new(self_member: Member, strategy: MapperStrategy) -> Self {
        Self::with_factory(self_member, Arc::new(strategy))
    }

    /// Start with no ready members, mapping through `factory`.
    pub fn with_factory(self_member: Member, factory: Arc<dyn MapperFactory>) -> Self {
        let ready = BTreeSet::new();
        let mapper = factory.build(&ready);
        let initial = MembershipSnapshot::new(self_member.clone(), ready, mapper, 0);

        Self {
            self_member,
            factory,
            snapshot: ArcSwap::from_pointee(initial),
            writer: Mutex::new(()),
            watches: Arc::new(WatchRegistry::new()),
        }
    }

    pub fn self_member(&self) -> &Member {
        &self.self_member
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Apply one membership change and publish the result.
    ///
    /// The new ready set is `(ready ∪ becoming_ready) − becoming_not_ready`. A
    /// member named in both sets ends up not ready. Concurrent callers are
    /// serialized; this returns once every watch has seen the change. A change
    /// that leaves the ready set as it was publishes nothing and returns the
    /// current snapshot.
    pub fn apply_change<R, N>(&self, becoming_ready: R, becoming_not_ready: N) -> Arc<MembershipSnapshot>
    where
        R: IntoIterator<Item = Member>,
        N: IntoIterator<Item = Member>,
    {
        let _writer = self.writer.lock();
        let previous = self.snapshot.load_full();

        let becoming_not_ready: BTreeSet<Member> = becoming_not_ready.into_iter().collect();
        let mut ready = previous.ready_members().clone();
        ready.extend(becoming_ready);
        ready.retain(|member| !becoming_not_ready.contains(member));

        if &ready == previous.ready_members() {
            tracing::trace!(
                version = previous.version(),
                "Membership change left ready set unchanged"
            );
            return previous;
        }

        let added: BTreeSet<Member> = ready.difference(previous.ready_members()).cloned().collect();
        let removed: BTreeSet<Member> =
            previous.ready_members().difference(&ready).cloned().collect();

        let mapper = self.factory.build(&ready);
        let snapshot = Arc::new(MembershipSnapshot::new(
            self.self_member.clone(),
            ready,
            mapper,
            previous.version() + 1,
        ));
        self.snapshot.store(snapshot.clone());

        tracing::debug!(
            version = snapshot.version(),
            ready = snapshot.ready_members().len(),
            added = added.len(),
            removed = removed.len(),
            self_ready = snapshot.self_ready(),
            "Cluster membership changed"
        );

        let changes = ClusterChanges {
            snapshot: snapshot.clone(),
            added,
            removed,
        };
        self.watches.notify(&changes);

        snapshot
    }

    /// Run `f` once every change submitted before this call has been applied
    /// and delivered to all watches.
    pub fn sync_point<T>(&self, f: impl FnOnce() -> T) -> T {
        let _writer = self.writer.lock();
        f()
    }
}

impl Cluster for ClusterMembership {
    fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.snapshot.load_full()
    }

    fn watch(&self, watch: ClusterWatch) -> WatchHandle {
        let _writer = self.writer.lock();
        let entry = self.watches.register(watch);
        WatchRegistry::deliver(&entry, &ClusterChanges::initial(self.snapshot.load_full()));

        tracing::debug!(watch_id = entry.id, "Registered cluster watch");
        WatchHandle {
            entry,
            registry: Arc::downgrade(&self.watches),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn member(name: &str, ip: &str) -> Member {
        Member::new(name, ip)
    }

    fn me() -> Member {
        member("me", "10.0.0.1")
    }

    fn new_cluster() -> ClusterMembership {
        ClusterMembership::new(me(), MapperStrategy::hash_ring())
    }

    fn recording_watch(cluster: &ClusterMembership) -> (WatchHandle, Arc<Mutex<Vec<ClusterChanges>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = cluster.watch(Box::new(move |changes| sink.lock().push(changes.clone())));
        (handle, seen)
    }

    fn names(members: &BTreeSet<Member>) -> Vec<&str> {
        members.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn test_starts_with_no_ready_members() {
        let cluster = new_cluster();
        let snapshot = cluster.snapshot();

        assert_eq!(snapshot.version(), 0);
        assert!(snapshot.ready_members().is_empty());
        assert!(!snapshot.self_ready());
        assert_eq!(snapshot.self_member(), &me());
        assert!(matches!(
            cluster.owner("foo"),
            Err(Error::NoMembersAvailable { .. })
        ));
    }

    #[test]
    fn test_apply_change_unions_then_subtracts() {
        let cluster = new_cluster();
        let a = member("a", "10.0.0.2");
        let b = member("b", "10.0.0.3");
        let c = member("c", "10.0.0.4");

        cluster.apply_change([a.clone(), b.clone()], []);
        let snapshot = cluster.apply_change([c.clone(), b.clone()], [b.clone(), a.clone()]);

        assert_eq!(names(snapshot.ready_members()), vec!["c"]);
        assert_eq!(snapshot.version(), 2);
        assert_eq!(cluster.owner("anything").unwrap(), c);
    }

    #[test]
    fn test_self_ready_tracks_membership() {
        let cluster = new_cluster();
        assert!(cluster.apply_change([me()], []).self_ready());
        assert!(!cluster.apply_change([], [me()]).self_ready());
    }

    #[test]
    fn test_unchanged_ready_set_is_not_published() {
        let cluster = new_cluster();
        let a = member("a", "10.0.0.2");
        cluster.apply_change([a.clone()], []);
        let (_handle, seen) = recording_watch(&cluster);

        let snapshot = cluster.apply_change([a.clone()], [member("ghost", "10.0.0.9")]);

        assert_eq!(snapshot.version(), 1);
        assert_eq!(seen.lock().len(), 1, "only the initial delivery");
    }

    #[test]
    fn test_watch_gets_current_snapshot_then_diffs() {
        let cluster = new_cluster();
        let a = member("larry-blerp", "10.0.0.3");
        let b = member("larry-blerp2", "10.0.0.4");
        cluster.apply_change([a.clone()], []);

        let (_handle, seen) = recording_watch(&cluster);
        cluster.apply_change([b.clone()], []);
        cluster.apply_change([], [a.clone()]);

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);

        assert_eq!(seen[0].snapshot.version(), 1);
        assert!(!seen[0].has_diff());
        assert_eq!(names(seen[0].snapshot.ready_members()), vec!["larry-blerp"]);

        assert_eq!(names(&seen[1].added), vec!["larry-blerp2"]);
        assert!(seen[1].removed.is_empty());

        assert!(seen[2].added.is_empty());
        assert_eq!(names(&seen[2].removed), vec!["larry-blerp"]);
        assert_eq!(names(seen[2].snapshot.ready_members()), vec!["larry-blerp2"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let cluster = new_cluster();
        let (handle, seen) = recording_watch(&cluster);
        assert_eq!(cluster.watch_count(), 1);

        cluster.apply_change([member("a", "10.0.0.2")], []);
        handle.unsubscribe();
        cluster.apply_change([member("b", "10.0.0.3")], []);

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(cluster.watch_count(), 0);
    }

    #[test]
    fn test_watches_run_in_registration_order() {
        let cluster = new_cluster();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            handles.push(cluster.watch(Box::new(move |changes| {
                if changes.has_diff() {
                    order.lock().push(i);
                }
            })));
        }

        cluster.apply_change([member("a", "10.0.0.2")], []);
        cluster.apply_change([member("b", "10.0.0.3")], []);

        assert_eq!(*order.lock(), vec![0, 1, 2, 0, 1, 2]);
        let ids: Vec<u64> = handles.iter().map(WatchHandle::id).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_panicking_watch_does_not_block_swap_or_later_watches() {
        let cluster = new_cluster();
        let _bad = cluster.watch(Box::new(|changes| {
            if changes.has_diff() {
                panic!("watch blew up");
            }
        }));
        let (_good, seen) = recording_watch(&cluster);

        let a = member("a", "10.0.0.2");
        let snapshot = cluster.apply_change([a.clone()], []);

        assert_eq!(cluster.snapshot().version(), snapshot.version());
        assert_eq!(cluster.owner("foo").unwrap(), a);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].snapshot.version(), 1);
    }

    #[test]
    fn test_slow_watch_delays_later_watches_but_not_readers() {
        let cluster = Arc::new(new_cluster());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);

        let _slow = cluster.watch(Box::new(move |changes| {
            if changes.has_diff() {
                entered_tx.send(()).unwrap();
                release_rx.lock().recv_timeout(Duration::from_secs(5)).unwrap();
            }
        }));
        let later_calls = Arc::new(AtomicUsize::new(0));
        let counter = later_calls.clone();
        let _later = cluster.watch(Box::new(move |changes| {
            if changes.has_diff() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let writer = {
            let cluster = cluster.clone();
            thread::spawn(move || cluster.apply_change([member("a", "10.0.0.2")], []))
        };

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // Swap already visible while the first watch is still running.
        assert_eq!(cluster.snapshot().version(), 1);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        writer.join().unwrap();
        cluster.sync_point(|| assert_eq!(later_calls.load(Ordering::SeqCst), 1));
    }

    #[test]
    fn test_concurrent_changes_never_interleave() {
        for _ in 0..20 {
            let cluster = Arc::new(new_cluster());
            let base = member("base", "10.0.0.10");
            cluster.apply_change([base.clone()], []);

            let (_handle, seen) = recording_watch(&cluster);
            let barrier = Arc::new(Barrier::new(2));

            let a = member("a", "10.0.0.2");
            let b = member("b", "10.0.0.3");
            let changes = [
                (vec![a.clone()], vec![base.clone()]),
                (vec![b.clone()], vec![a.clone()]),
            ];

            let threads: Vec<_> = changes
                .iter()
                .cloned()
                .map(|(ready, not_ready)| {
                    let cluster = cluster.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        cluster.apply_change(ready, not_ready);
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }

            let final_ready = names(cluster.snapshot().ready_members())
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>();
            // first then second: {b}; second then first: {a, b}
            assert!(
                final_ready == vec!["b"] || final_ready == vec!["a", "b"],
                "unexpected final set {:?}",
                final_ready
            );

            let seen = seen.lock();
            assert_eq!(seen.len(), 3, "initial delivery plus exactly two changes");
            assert_eq!(seen[1].snapshot.version(), 2);
            assert_eq!(seen[2].snapshot.version(), 3);
        }
    }

    #[test]
    fn test_old_snapshot_survives_change() {
        let cluster = new_cluster();
        let a = member("a", "10.0.0.2");
        let b = member("b", "10.0.0.3");
        cluster.apply_change([a.clone()], []);

        let held = cluster.snapshot();
        cluster.apply_change([b], [a.clone()]);

        assert_eq!(held.owner("foo").unwrap(), a);
        assert_eq!(held.version(), 1);
        assert_eq!(cluster.snapshot().version(), 2);
    }
}

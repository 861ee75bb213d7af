use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{Cluster, ClusterWeightProvider, Error, ListenerError, WatchHandle};

/// Notified when this process gains or loses a lease.
///
/// Callbacks run on whichever thread noticed the transition, while that
/// thread holds the lease's transition lock. Edges on one lease are therefore
/// delivered one at a time and in order. A listener may call back into its
/// own lease from the same thread: nested checks report ownership without
/// starting another transition. Waiting on another thread that checks the
/// same lease deadlocks, and so does applying a membership change from a
/// listener.
///
/// An error is reported to the caller of the check that triggered it; it does
/// not undo the transition.
pub trait LeaseListener: Send + Sync {
    /// Called after the lease became held.
    fn after_acquire(&self, _lease: &Lease) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Called while the lease is still held locally, right before it is
    /// given up. Use it to flush work that requires ownership.
    fn before_release(&self, _lease: &Lease) -> Result<(), ListenerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    NotHeld,
    Held,
    Releasing,
}

#[derive(Debug, Clone, Copy)]
enum Edge {
    Acquire,
    Release,
}

impl Edge {
    fn as_str(self) -> &'static str {
        match self {
            Self::Acquire => "after_acquire",
            Self::Release => "before_release",
        }
    }
}

struct LeaseInner {
    state: LeaseState,
    listeners: Vec<Arc<dyn LeaseListener>>,
    notifying: bool,
}

/// Clears the notifying flag even if a listener panics.
struct NotifyingGuard<'a> {
    lease: &'a Lease,
    previous: bool,
}

impl Drop for NotifyingGuard<'_> {
    fn drop(&mut self) {
        self.lease.inner.lock().notifying = self.previous;
    }
}

/// A named duty that at most one process in the fleet should perform.
///
/// Holding is decided locally: the lease is held iff the current snapshot
/// maps its resource id to this process and the cluster weight is nonzero.
/// Nothing is written anywhere, so every check is a local computation.
///
/// Checks on one lease are serialized: the snapshot is read, the transition
/// decided and its listeners notified under one transition lock, so a check
/// that starts after a membership change always settles the lease last.
pub struct Lease {
    name: String,
    resource_id: String,
    cluster: Arc<dyn Cluster>,
    weight: Arc<dyn ClusterWeightProvider>,
    transition: ReentrantMutex<()>,
    inner: Mutex<LeaseInner>,
}

impl Lease {
    fn new(
        name: String,
        resource_id: String,
        cluster: Arc<dyn Cluster>,
        weight: Arc<dyn ClusterWeightProvider>,
    ) -> Self {
        Self {
            name,
            resource_id,
            cluster,
            weight,
            transition: ReentrantMutex::new(()),
            inner: Mutex::new(LeaseInner {
                state: LeaseState::NotHeld,
                listeners: Vec::new(),
                notifying: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The id looked up in the resource mapper.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Whether this process ought to hold the lease right now.
    pub fn should_hold(&self) -> bool {
        if !self.weight.weight().is_active() {
            return false;
        }
        match self.cluster.snapshot().is_owned_by_self(&self.resource_id) {
            Ok(owned) => owned,
            Err(e) => {
                // No healthy members yet
                tracing::debug!(lease = %self.name, error = %e, "No desired holder for lease");
                false
            }
        }
    }

    /// Recompute ownership against the latest snapshot and weight, firing
    /// listeners if the answer changed since the last check.
    ///
    /// Called from inside one of this lease's listeners, it only reports
    /// ownership; the running transition finishes first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Listener`] if a listener failed. The transition has
    /// already been recorded.
    pub fn check_held(&self) -> Result<bool, Error> {
        let _transition = self.transition.lock();
        let should_hold = self.should_hold();
        if self.inner.lock().notifying {
            return Ok(should_hold);
        }
        self.reconcile(should_hold)?;
        Ok(should_hold)
    }

    /// Try to take the lease. Local and idempotent; equivalent to
    /// [`check_held`](Lease::check_held).
    pub fn acquire(&self) -> Result<bool, Error> {
        self.check_held()
    }

    /// Whether some other process should be holding the lease. Passive
    /// deployments always report true.
    pub fn check_held_elsewhere(&self) -> bool {
        if !self.weight.weight().is_active() {
            return true;
        }
        match self.cluster.snapshot().is_owned_by_self(&self.resource_id) {
            Ok(owned) => !owned,
            Err(_) => false,
        }
    }

    /// The state recorded by the last check. Stays true while `before_release`
    /// listeners run.
    pub fn is_held_locally(&self) -> bool {
        matches!(
            self.inner.lock().state,
            LeaseState::Held | LeaseState::Releasing
        )
    }

    /// Give up the lease if held. The next check takes it again if this
    /// process still should hold it. Does nothing from inside a listener.
    ///
    /// Returns whether the lease was held.
    pub fn release(&self) -> Result<bool, Error> {
        let _transition = self.transition.lock();
        {
            let inner = self.inner.lock();
            if inner.notifying || inner.state != LeaseState::Held {
                return Ok(false);
            }
        }
        self.release_held()?;
        Ok(true)
    }

    /// Register `listener`. If the lease is already held it receives one
    /// `after_acquire` before this returns; otherwise ownership is re-checked
    /// and every listener hears about an acquisition.
    pub fn add_listener(&self, listener: Arc<dyn LeaseListener>) -> Result<(), Error> {
        let _transition = self.transition.lock();
        let (already_held, notifying) = {
            let mut inner = self.inner.lock();
            inner.listeners.push(listener.clone());
            (inner.state == LeaseState::Held, inner.notifying)
        };

        if already_held {
            self.notify(&[listener], Edge::Acquire)
        } else if notifying {
            Ok(())
        } else {
            self.reconcile(self.should_hold())
        }
    }

    /// Apply the edge implied by `should_hold`. Caller holds the transition
    /// lock.
    fn reconcile(&self, should_hold: bool) -> Result<(), Error> {
        let state = self.inner.lock().state;
        match (should_hold, state) {
            (true, LeaseState::NotHeld) => {
                let listeners = self.enter_state(LeaseState::Held);
                tracing::info!(lease = %self.name, "Acquired lease");
                self.notify(&listeners, Edge::Acquire)
            }
            (false, LeaseState::Held) => self.release_held(),
            _ => Ok(()),
        }
    }

    fn release_held(&self) -> Result<(), Error> {
        let listeners = self.enter_state(LeaseState::Releasing);
        let result = self.notify(&listeners, Edge::Release);
        self.enter_state(LeaseState::NotHeld);
        tracing::info!(lease = %self.name, "Released lease");
        result
    }

    fn enter_state(&self, state: LeaseState) -> Vec<Arc<dyn LeaseListener>> {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.listeners.clone()
    }

    fn notify(&self, listeners: &[Arc<dyn LeaseListener>], edge: Edge) -> Result<(), Error> {
        let _notifying = {
            let mut inner = self.inner.lock();
            NotifyingGuard {
                lease: self,
                previous: std::mem::replace(&mut inner.notifying, true),
            }
        };

        let mut first_error = None;
        for listener in listeners {
            let result = match edge {
                Edge::Acquire => listener.after_acquire(self),
                Edge::Release => listener.before_release(self),
            };
            if let Err(source) = result {
                tracing::error!(
                    lease = %self.name,
                    callback = edge.as_str(),
                    error = %source,
                    "Lease listener failed"
                );
                if first_error.is_none() {
                    first_error = Some(source);
                }
            }
        }

        match first_error {
            Some(source) => Err(Error::Listener {
                lease: self.name.clone(),
                source,
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Lease")
            .field("name", &self.name)
            .field("resource_id", &self.resource_id)
            .field("state", &inner.state)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

/// Hands out one [`Lease`] per name and keeps them reconciled.
pub struct LeaseCoordinator {
    cluster: Arc<dyn Cluster>,
    weight: Arc<dyn ClusterWeightProvider>,
    namespace: Option<String>,
    leases: RwLock<HashMap<String, Arc<Lease>>>,
}

impl LeaseCoordinator {
    pub fn new(cluster: Arc<dyn Cluster>, weight: Arc<dyn ClusterWeightProvider>) -> Self {
        Self {
            cluster,
            weight,
            namespace: None,
            leases: RwLock::new(HashMap::new()),
        }
    }

    /// Prefix lease resource ids with `namespace`, so lease `foo` maps as
    /// `"{namespace}/foo"`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let namespace = namespace.trim_end_matches('/');
        self.namespace = (!namespace.is_empty()).then(|| namespace.to_string());
        self
    }

    pub fn resource_id_for(&self, name: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}/{}", namespace, name),
            None => name.to_string(),
        }
    }

    /// Same `Arc` for every request of the same name.
    pub fn request_lease(&self, name: &str) -> Arc<Lease> {
        if let Some(lease) = self.leases.read().get(name) {
            return lease.clone();
        }

        self.leases
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                let resource_id = self.resource_id_for(name);
                tracing::debug!(lease = name, resource_id = %resource_id, "Created lease");
                Arc::new(Lease::new(
                    name.to_string(),
                    resource_id,
                    self.cluster.clone(),
                    self.weight.clone(),
                ))
            })
            .clone()
    }

    /// All requested leases, ordered by name.
    pub fn leases(&self) -> Vec<Arc<Lease>> {
        let mut leases: Vec<Arc<Lease>> = self.leases.read().values().cloned().collect();
        leases.sort_by(|a, b| a.name.cmp(&b.name));
        leases
    }

    /// Re-check every lease. All leases are checked even if one fails; the
    /// first error is returned.
    pub fn check_all_leases(&self) -> Result<(), Error> {
        let mut first_error = None;
        for lease in self.leases() {
            if let Err(e) = lease.check_held() {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Reconcile all leases whenever membership changes. The watch holds only
    /// a weak reference to the coordinator.
    pub fn watch_cluster(self: &Arc<Self>) -> WatchHandle {
        let coordinator = Arc::downgrade(self);
        self.cluster.watch(Box::new(move |changes| {
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            if let Err(e) = coordinator.check_all_leases() {
                tracing::warn!(
                    version = changes.snapshot.version(),
                    error = %e,
                    "Lease reconciliation after membership change failed"
                );
            }
        }))
    }
}

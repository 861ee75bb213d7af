//! Tokio tasks that feed membership events in and keep leases fresh.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{ClusterMembership, LeaseCoordinator, Member};

/// One push event from whatever discovers members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    #[serde(default)]
    pub becoming_ready: Vec<Member>,
    #[serde(default)]
    pub becoming_not_ready: Vec<Member>,
}

impl MembershipChange {
    pub fn ready(member: Member) -> Self {
        Self {
            becoming_ready: vec![member],
            becoming_not_ready: Vec::new(),
        }
    }

    pub fn not_ready(member: Member) -> Self {
        Self {
            becoming_ready: Vec::new(),
            becoming_not_ready: vec![member],
        }
    }
}

/// Apply changes from `changes` in arrival order until the channel closes or
/// `cancel_token` fires.
///
/// Each change is applied on the blocking pool, since applying waits for the
/// writer lock and runs every watch (and through `watch_cluster`, every lease
/// listener). The next change is taken only after the previous one finished.
pub fn spawn_membership_pump(
    cluster: Arc<ClusterMembership>,
    mut changes: mpsc::Receiver<MembershipChange>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    tracing::debug!("Membership pump shutting down");
                    break;
                }
                change = changes.recv() => {
                    let Some(change) = change else {
                        tracing::debug!("Membership event channel closed");
                        break;
                    };
                    let writer = cluster.clone();
                    let applied = tokio::task::spawn_blocking(move || {
                        writer.apply_change(change.becoming_ready, change.becoming_not_ready)
                    })
                    .await;
                    match applied {
                        Ok(snapshot) => {
                            tracing::trace!(version = snapshot.version(), "Applied membership event");
                        }
                        Err(e) => tracing::error!("Membership change task failed: {}", e),
                    }
                }
            }
        }
    })
}

/// Re-check every lease each `interval`, so weight flips take effect without
/// waiting for a membership change. Checks run on the blocking pool, as lease
/// listeners may block.
pub fn spawn_lease_refresh(
    coordinator: Arc<LeaseCoordinator>,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut refresh_interval = tokio::time::interval(interval);
        refresh_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    tracing::debug!("Lease refresh task shutting down");
                    break;
                }
                _ = refresh_interval.tick() => {
                    let coordinator = coordinator.clone();
                    match tokio::task::spawn_blocking(move || coordinator.check_all_leases()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!("Lease refresh failed: {}", e),
                        Err(e) => tracing::error!("Lease refresh task failed: {}", e),
                    }
                }
            }
        }
    })
}

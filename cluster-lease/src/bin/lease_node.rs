//! Interactive cluster node for trying out ownership and leases.
//!
//! Reads commands on stdin and reports JSON lines on stdout; logs go to
//! stderr. Membership is fed by hand:
//!
//! ```text
//! ready mork 10.0.0.2      # mark a member ready
//! notready mork 10.0.0.2   # mark it not ready
//! owner some-resource      # who owns a resource id
//! lease nightly-report     # request a lease and report whether it is held
//! weight 0                 # flip the cluster weight
//! status
//! quit
//! ```
//!
//! Run: CLUSTER_SELF_NAME=zork cargo run -p cluster-lease --bin lease_node

use cluster_lease::{
    spawn_lease_refresh, spawn_membership_pump, AtomicClusterWeight, Cluster, ClusterConfig,
    ClusterMembership, ClusterWeightProvider, Lease, LeaseCoordinator, LeaseListener,
    ListenerError, Member, MembershipChange,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ClusterConfig::from_env()?;
    let self_member = config.self_member();
    tracing::info!(
        member = %self_member,
        mapper = config.mapper.as_str(),
        hash = %config.hash,
        weight = %config.weight,
        "Starting lease node"
    );

    let cluster = Arc::new(ClusterMembership::new(
        self_member.clone(),
        config.mapper_strategy(),
    ));
    let weight = Arc::new(AtomicClusterWeight::new(config.weight));
    let mut coordinator = LeaseCoordinator::new(cluster.clone(), weight.clone());
    if let Some(namespace) = &config.lease_namespace {
        coordinator = coordinator.with_namespace(namespace.clone());
    }
    let coordinator = Arc::new(coordinator);
    let cluster_watch = coordinator.watch_cluster();

    let cancel_token = CancellationToken::new();
    let (changes_tx, changes_rx) = mpsc::channel(64);
    let pump_handle = spawn_membership_pump(cluster.clone(), changes_rx, cancel_token.clone());
    let refresh_handle = spawn_lease_refresh(
        coordinator.clone(),
        config.lease_refresh_interval,
        cancel_token.clone(),
    );

    changes_tx
        .send(MembershipChange::ready(self_member.clone()))
        .await?;

    let mut watched = HashSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0] {
            "ready" | "notready" => {
                let Some(member) = parse_member(&parts[1..]) else {
                    emit(json!({"error": "usage", "command": parts[0], "args": "<name> <address>"}));
                    continue;
                };
                let change = if parts[0] == "ready" {
                    MembershipChange::ready(member)
                } else {
                    MembershipChange::not_ready(member)
                };
                changes_tx.send(change).await?;
            }
            "owner" => {
                let Some(resource_id) = parts.get(1) else {
                    emit(json!({"error": "usage", "command": "owner", "args": "<resource-id>"}));
                    continue;
                };
                let snapshot = cluster.snapshot();
                match snapshot.owner(resource_id) {
                    Ok(owner) => emit(json!({
                        "event": "owner",
                        "resource_id": resource_id,
                        "owner": owner,
                        "is_self": owner.name == self_member.name,
                        "version": snapshot.version(),
                    })),
                    Err(e) => emit(json!({
                        "event": "owner",
                        "resource_id": resource_id,
                        "error": e.to_string(),
                    })),
                }
            }
            "lease" => {
                let Some(name) = parts.get(1) else {
                    emit(json!({"error": "usage", "command": "lease", "args": "<name>"}));
                    continue;
                };
                let lease = coordinator.request_lease(name);
                let result = if watched.insert(name.to_string()) {
                    lease.add_listener(Arc::new(EventListener))
                } else {
                    lease.check_held().map(|_| ())
                };
                if let Err(e) = result {
                    tracing::warn!(lease = %name, error = %e, "Lease listener failed");
                }
                emit(lease_status(&lease));
            }
            "weight" => {
                let value = parts.get(1).and_then(|s| s.parse::<u32>().ok());
                match value.map(|value| weight.set_weight(value)) {
                    Some(Ok(())) => {
                        let checker = coordinator.clone();
                        match tokio::task::spawn_blocking(move || checker.check_all_leases()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::warn!(error = %e, "Lease check after weight change failed")
                            }
                            Err(e) => tracing::error!("Lease check task failed: {}", e),
                        }
                        emit(json!({"event": "weight", "weight": weight.weight().get()}));
                    }
                    Some(Err(e)) => emit(json!({"error": e.to_string()})),
                    None => emit(json!({"error": "usage", "command": "weight", "args": "<0-100>"})),
                }
            }
            "status" => emit(status(&cluster, &coordinator, weight.as_ref())),
            "quit" | "exit" => break,
            other => emit(json!({"error": "unknown_command", "command": other})),
        }
    }

    cluster_watch.unsubscribe();
    cancel_token.cancel();
    pump_handle.await?;
    refresh_handle.await?;

    for lease in coordinator.leases() {
        if let Err(e) = lease.release() {
            tracing::warn!(lease = lease.name(), error = %e, "Release on shutdown failed");
        }
    }

    emit(json!({"event": "shutdown", "member": self_member}));
    Ok(())
}

/// Prints lease transitions as they happen.
struct EventListener;

impl LeaseListener for EventListener {
    fn after_acquire(&self, lease: &Lease) -> Result<(), ListenerError> {
        emit(json!({"event": "acquired", "lease": lease.name()}));
        Ok(())
    }

    fn before_release(&self, lease: &Lease) -> Result<(), ListenerError> {
        emit(json!({"event": "releasing", "lease": lease.name()}));
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_logs = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

fn parse_member(args: &[&str]) -> Option<Member> {
    match args {
        [name, address] => Some(Member::new(*name, *address)),
        _ => None,
    }
}

fn lease_status(lease: &Lease) -> Value {
    json!({
        "event": "lease",
        "lease": lease.name(),
        "resource_id": lease.resource_id(),
        "held": lease.is_held_locally(),
        "held_elsewhere": lease.check_held_elsewhere(),
    })
}

fn status(
    cluster: &ClusterMembership,
    coordinator: &LeaseCoordinator,
    weight: &dyn ClusterWeightProvider,
) -> Value {
    let snapshot = cluster.snapshot();
    let leases = coordinator.leases();
    let held: Vec<&str> = leases
        .iter()
        .filter(|lease| lease.is_held_locally())
        .map(|lease| lease.name())
        .collect();

    json!({
        "event": "status",
        "self": snapshot.self_member(),
        "self_ready": snapshot.self_ready(),
        "version": snapshot.version(),
        "members": snapshot.ready_members(),
        "weight": weight.weight().get(),
        "leases": leases.len(),
        "held": held,
    })
}

fn emit(value: Value) {
    println!("{}", value);
    let _ = io::stdout().flush();
}

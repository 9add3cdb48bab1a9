//! Idempotent cluster deletion
//!
//! [`ClusterDrainer`] walks the resource kinds in a fixed order. Each kind is
//! a small state machine: it stays `Pending` while the provider still lists
//! matching resources, deleting whatever it finds and waiting before looking
//! again, and becomes `Converged` once the list is empty. A failed list call
//! restarts the whole walk from the first kind after a delay. Failures to
//! delete a single resource are logged and picked up by the next listing.
//!
//! Deletion never gives up on its own: it ends when everything is gone or the
//! run is cancelled.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClusterSpec;
use crate::provider::{list_all_servers, CloudProvider, ResourceId};
use crate::retry::sleep_or_cancel;
use crate::selector::LabelSelector;
use crate::{Error, Result};

/// Resource kinds in deletion order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceKind {
    /// The cluster network
    Network,
    /// The uploaded SSH key
    SshKey,
    /// The API load balancer and every CCM load balancer in the account
    LoadBalancers,
    /// Masters and every autoscaler worker in the account
    Servers,
    /// The master placement group
    PlacementGroup,
    /// Firewalls labelled with the cluster name
    Firewalls,
    /// Every volume in the account
    Volumes,
}

impl ResourceKind {
    /// Deletion order
    pub const ORDER: [ResourceKind; 7] = [
        ResourceKind::Network,
        ResourceKind::SshKey,
        ResourceKind::LoadBalancers,
        ResourceKind::Servers,
        ResourceKind::PlacementGroup,
        ResourceKind::Firewalls,
        ResourceKind::Volumes,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Network => "network",
            ResourceKind::SshKey => "ssh key",
            ResourceKind::LoadBalancers => "load balancers",
            ResourceKind::Servers => "servers",
            ResourceKind::PlacementGroup => "placement group",
            ResourceKind::Firewalls => "firewalls",
            ResourceKind::Volumes => "volumes",
        };
        f.write_str(name)
    }
}

/// Per-kind reconciliation state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindState {
    /// Matching resources may remain
    Pending,
    /// The provider lists nothing for this kind
    Converged,
}

/// How a deletion run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every kind converged
    Converged,
    /// The run was cancelled first
    Cancelled,
}

struct Target {
    id: ResourceId,
    name: String,
}

/// Deletes every resource the cluster owns
pub struct ClusterDrainer {
    spec: Arc<ClusterSpec>,
    provider: Arc<dyn CloudProvider>,
    wait: Duration,
}

impl ClusterDrainer {
    /// Create a drainer waiting `waitTimeInRetry` between passes
    pub fn new(spec: Arc<ClusterSpec>, provider: Arc<dyn CloudProvider>) -> Self {
        let wait = spec.master_servers.wait_time_in_retry;
        Self {
            spec,
            provider,
            wait,
        }
    }

    /// Delete everything, retrying until converged or cancelled
    pub async fn delete_cluster(&self, cancel: &CancellationToken) -> DrainOutcome {
        info!(cluster = %self.spec.cluster_name, "Deleting cluster");

        if !self.spec.dedicated_account {
            warn!(
                "dedicatedAccount is false: volumes are kept, but every autoscaler worker \
                 and every CCM load balancer in the account is still deleted"
            );
        }

        loop {
            match self.drain_all(cancel).await {
                Ok(()) => {
                    info!(cluster = %self.spec.cluster_name, "Cluster deleted");
                    return DrainOutcome::Converged;
                }
                Err(e) if e.is_cancelled() => {
                    warn!("Deletion cancelled");
                    return DrainOutcome::Cancelled;
                }
                Err(e) => {
                    warn!(error = %e, "Deletion pass failed, restarting from the first resource kind");
                    if sleep_or_cancel(cancel, self.wait, "delete cluster").await.is_err() {
                        warn!("Deletion cancelled");
                        return DrainOutcome::Cancelled;
                    }
                }
            }
        }
    }

    async fn drain_all(&self, cancel: &CancellationToken) -> Result<()> {
        for kind in ResourceKind::ORDER {
            self.drain_kind(kind, cancel).await?;
        }
        Ok(())
    }

    async fn drain_kind(&self, kind: ResourceKind, cancel: &CancellationToken) -> Result<()> {
        if kind == ResourceKind::Volumes && !self.spec.dedicated_account {
            return Ok(());
        }

        let mut state = KindState::Pending;
        while state == KindState::Pending {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!("delete {}", kind)));
            }

            let targets = self.list(kind).await?;
            if targets.is_empty() {
                debug!(kind = %kind, "No resources left");
                state = KindState::Converged;
                continue;
            }

            for target in &targets {
                match self.delete(kind, target.id).await {
                    Ok(()) => info!(kind = %kind, name = %target.name, "Deleted"),
                    Err(e) => warn!(kind = %kind, name = %target.name, error = %e, "Delete failed"),
                }
            }

            sleep_or_cancel(cancel, self.wait, "delete cluster").await?;
        }

        Ok(())
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<Target>> {
        let provider = self.provider.as_ref();
        let name = self.spec.cluster_name.as_str();

        let targets: Vec<Target> = match kind {
            ResourceKind::Network => provider
                .get_network(name)
                .await?
                .map(|n| Target { id: n.id, name: n.name })
                .into_iter()
                .collect(),
            ResourceKind::SshKey => provider
                .get_ssh_key(name)
                .await?
                .map(|k| Target { id: k.id, name: k.name })
                .into_iter()
                .collect(),
            ResourceKind::LoadBalancers => {
                let named = provider.get_load_balancer(name).await?;
                let dynamic = provider
                    .list_load_balancers(&LabelSelector::ccm_load_balancers())
                    .await?;
                dedup(
                    named
                        .into_iter()
                        .chain(dynamic)
                        .map(|l| Target { id: l.id, name: l.name }),
                )
            }
            ResourceKind::Servers => {
                let masters = list_all_servers(provider, &self.spec.master_selector()).await?;
                let workers = list_all_servers(provider, &self.spec.node_group_selector()).await?;
                dedup(
                    masters
                        .into_iter()
                        .chain(workers)
                        .map(|s| Target { id: s.id, name: s.name }),
                )
            }
            ResourceKind::PlacementGroup => provider
                .get_placement_group(&self.spec.master_servers.placement_group_name)
                .await?
                .map(|p| Target { id: p.id, name: p.name })
                .into_iter()
                .collect(),
            ResourceKind::Firewalls => provider
                .list_firewalls(&self.spec.cluster_selector())
                .await?
                .into_iter()
                .map(|f| Target { id: f.id, name: f.name })
                .collect(),
            ResourceKind::Volumes => provider
                .list_volumes()
                .await?
                .into_iter()
                .map(|v| Target { id: v.id, name: v.name })
                .collect(),
        };

        Ok(targets)
    }

    async fn delete(&self, kind: ResourceKind, id: ResourceId) -> Result<()> {
        let provider = self.provider.as_ref();
        match kind {
            ResourceKind::Network => provider.delete_network(id).await,
            ResourceKind::SshKey => provider.delete_ssh_key(id).await,
            ResourceKind::LoadBalancers => provider.delete_load_balancer(id).await,
            ResourceKind::Servers => provider.delete_server(id).await,
            ResourceKind::PlacementGroup => provider.delete_placement_group(id).await,
            ResourceKind::Firewalls => provider.delete_firewall(id).await,
            ResourceKind::Volumes => provider.delete_volume(id).await,
        }
    }
}

fn dedup(targets: impl Iterator<Item = Target>) -> Vec<Target> {
    let mut seen = BTreeSet::new();
    targets.filter(|t| seen.insert(t.id)).collect()
}

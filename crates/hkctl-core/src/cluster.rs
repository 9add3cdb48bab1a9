//! Facade over the cluster operations
//!
//! Every CLI action goes through [`ClusterApi`]; it owns the provider client
//! and the remote executor and hands them to the component that does the work.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adhoc::{AdhocRequest, AdhocStatus, FleetCommandExecutor};
use crate::config::ClusterSpec;
use crate::drain::{ClusterDrainer, DrainOutcome};
use crate::firewall::FirewallRole;
use crate::pipeline::{ProvisioningPipeline, RunState};
use crate::post_install::PostInstallRunner;
use crate::provider::{CloudProvider, Firewall, HcloudClient, Location, ServerType};
use crate::readiness::ReadinessPoller;
use crate::remote::{RemoteExecutor, SshExecutor};
use crate::{Error, Result};

/// Datacenter entry of [`Configurations`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DatacenterSummary {
    /// Location the datacenter is in
    pub location: String,
    /// Datacenter name
    pub name: String,
}

/// What the provider account offers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Configurations {
    /// Location names
    pub locations: Vec<String>,
    /// Datacenters with their location
    pub datacenters: Vec<DatacenterSummary>,
    /// Server type names
    pub server_types: Vec<String>,
}

/// Entry point for cluster operations
pub struct ClusterApi {
    spec: Arc<ClusterSpec>,
    provider: Arc<dyn CloudProvider>,
    executor: Arc<dyn RemoteExecutor>,
}

impl ClusterApi {
    /// Create an API talking to Hetzner Cloud and to servers over SSH
    pub fn new(spec: Arc<ClusterSpec>) -> Result<Self> {
        let provider = Arc::new(HcloudClient::new(spec.hetzner_token.clone())?);
        let executor = Arc::new(SshExecutor::new(spec.ssh_private_key.clone()));
        Ok(Self::with_components(spec, provider, executor))
    }

    /// Create an API from explicit components
    pub fn with_components(
        spec: Arc<ClusterSpec>,
        provider: Arc<dyn CloudProvider>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            spec,
            provider,
            executor,
        }
    }

    /// The loaded cluster spec
    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Check that the configured location and datacenter exist
    pub async fn validate(&self) -> Result<()> {
        let location = self.provider.get_location(&self.spec.location).await?;
        if location.is_none() {
            return Err(Error::validation(format!(
                "location {} not found",
                self.spec.location
            )));
        }

        let datacenter = self.provider.get_datacenter(&self.spec.datacenter).await?;
        match datacenter {
            None => Err(Error::validation(format!(
                "datacenter {} not found",
                self.spec.datacenter
            ))),
            Some(dc) if dc.location != self.spec.location => Err(Error::validation(format!(
                "datacenter {} is in {}, not {}",
                dc.name, dc.location, self.spec.location
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Provision the cluster
    pub async fn create(&self, cancel: &CancellationToken) -> Result<RunState> {
        ProvisioningPipeline::new(
            self.spec.clone(),
            self.provider.clone(),
            self.executor.clone(),
        )
        .create_cluster(cancel)
        .await
    }

    /// Remove every cluster resource, retrying until done or cancelled
    pub async fn delete(&self, cancel: &CancellationToken) -> DrainOutcome {
        ClusterDrainer::new(self.spec.clone(), self.provider.clone())
            .delete_cluster(cancel)
            .await
    }

    /// Re-fetch the scripts and re-run post-install on the first master
    pub async fn patch(&self, cancel: &CancellationToken) -> Result<()> {
        let poller = Arc::new(ReadinessPoller::new(
            self.provider.clone(),
            self.executor.clone(),
            self.spec.retry_policy(),
        ));
        let runner = PostInstallRunner::new(self.spec.clone(), self.executor.clone(), poller);
        runner
            .run(&self.spec.server_components.ubuntu.user_name, true, cancel)
            .await
    }

    /// Run a command across the fleet
    pub async fn adhoc(&self, request: &AdhocRequest) -> Result<AdhocStatus> {
        FleetCommandExecutor::new(
            self.spec.clone(),
            self.provider.clone(),
            self.executor.clone(),
        )
        .run_adhoc(request)
        .await
    }

    /// Locations, datacenters and server types offered by the provider
    pub async fn list_configurations(&self) -> Result<Configurations> {
        let locations: Vec<Location> = self.provider.list_locations().await?;
        let datacenters = self.provider.list_datacenters().await?;
        let server_types: Vec<ServerType> = self.provider.list_server_types().await?;

        Ok(Configurations {
            locations: locations.into_iter().map(|l| l.name).collect(),
            datacenters: datacenters
                .into_iter()
                .map(|d| DatacenterSummary {
                    location: d.location,
                    name: d.name,
                })
                .collect(),
            server_types: server_types.into_iter().map(|t| t.name).collect(),
        })
    }

    /// Create the selected firewalls for an existing cluster
    pub async fn create_firewalls(&self, control_plane: bool, workers: bool) -> Result<Vec<Firewall>> {
        let pipeline = ProvisioningPipeline::new(
            self.spec.clone(),
            self.provider.clone(),
            self.executor.clone(),
        );

        let mut created = Vec::new();
        if control_plane {
            created.push(pipeline.create_firewall(FirewallRole::ControlPlane).await?);
        }
        if workers {
            created.push(pipeline.create_firewall(FirewallRole::Workers).await?);
        }
        if created.is_empty() {
            info!("No firewall selected");
        }
        Ok(created)
    }
}

//! Ordered cluster provisioning
//!
//! [`ProvisioningPipeline::create_cluster`] creates the network, firewalls,
//! SSH key, load balancer, placement group and masters, initializes the first
//! master, joins the rest and runs post-install. Each step fails fast except
//! kubeconfig persistence and individual master joins, which are logged and
//! skipped. Nothing is rolled back; a partial cluster is removed with
//! `delete`.

use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ClusterSpec, ServerRole};
use crate::error::StepContext;
use crate::firewall::{firewall_request, FirewallRole};
use crate::post_install::PostInstallRunner;
use crate::provider::{
    CloudProvider, Firewall, LoadBalancer, LoadBalancerCreate, Network, NetworkCreate,
    PlacementGroupCreate, ServerCreate, SshKey, SshKeyCreate,
};
use crate::readiness::ReadinessPoller;
use crate::remote::RemoteExecutor;
use crate::retry::retry_bounded;
use crate::{scripts, Error, Result};

/// Credentials fetched from the first master
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterCredentials {
    /// Script that joins another master to the control plane
    pub master_cluster_join: String,
    /// Admin kubeconfig
    pub cluster_kube_config: String,
}

/// State of one `create` run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunState {
    /// Principal used for SSH; switched from the bootstrap user to the admin
    /// user once control-plane init has run
    pub ssh_user: String,
    /// Set once fetched from the first master
    pub credentials: Option<ClusterCredentials>,
}

impl RunState {
    /// Fresh run connecting as `bootstrap_user`
    pub fn new(bootstrap_user: impl Into<String>) -> Self {
        Self {
            ssh_user: bootstrap_user.into(),
            credentials: None,
        }
    }
}

/// Creates a cluster from scratch
pub struct ProvisioningPipeline {
    spec: Arc<ClusterSpec>,
    provider: Arc<dyn CloudProvider>,
    executor: Arc<dyn RemoteExecutor>,
    poller: Arc<ReadinessPoller>,
    post_install: PostInstallRunner,
}

impl ProvisioningPipeline {
    /// Create a pipeline; the retry budget comes from `masterServers`
    pub fn new(
        spec: Arc<ClusterSpec>,
        provider: Arc<dyn CloudProvider>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let poller = Arc::new(ReadinessPoller::new(
            provider.clone(),
            executor.clone(),
            spec.retry_policy(),
        ));
        let post_install = PostInstallRunner::new(spec.clone(), executor.clone(), poller.clone());

        Self {
            spec,
            provider,
            executor,
            poller,
            post_install,
        }
    }

    /// Run every provisioning step in order
    pub async fn create_cluster(&self, cancel: &CancellationToken) -> Result<RunState> {
        info!(cluster = %self.spec.cluster_name, masters = self.spec.master_count, "Creating cluster");

        checkpoint(cancel, "create network")?;
        let network = self.create_network().await.step("create network")?;

        for role in [FirewallRole::ControlPlane, FirewallRole::Workers] {
            checkpoint(cancel, "create firewalls")?;
            self.create_firewall(role)
                .await
                .step("create firewalls")?;
        }

        checkpoint(cancel, "create ssh key")?;
        let ssh_key = self.create_ssh_key().await.step("create ssh key")?;
        checkpoint(cancel, "create load balancer")?;
        let load_balancer = self
            .create_load_balancer(&network)
            .await
            .step("create load balancer")?;
        checkpoint(cancel, "create servers")?;
        self.create_servers(&network, &ssh_key, &load_balancer, cancel)
            .await
            .step("create servers")?;

        let mut state = RunState::new(&self.spec.server_components.ubuntu.bootstrap_user);
        let credentials = self
            .init_first_master(&mut state, cancel)
            .await
            .step("init first master")?;

        if let Err(e) =
            save_kubeconfig(&self.spec.kube_config_path, &credentials.cluster_kube_config).await
        {
            warn!(path = %self.spec.kube_config_path.display(), error = %e, "Failed to save kubeconfig");
        }

        for index in 2..=self.spec.master_count {
            let server = self.spec.master_name(index);
            if let Err(e) = self
                .join_master(&server, &state.ssh_user, &credentials.master_cluster_join, cancel)
                .await
            {
                if e.is_cancelled() {
                    return Err(e).step("join masters");
                }
                error!(server = %server, error = %e, "Failed to join master, continuing with fewer masters");
            }
        }

        self.post_install
            .run(&state.ssh_user, false, cancel)
            .await
            .step("post install")?;

        info!(cluster = %self.spec.cluster_name, "Cluster created");
        Ok(state)
    }

    async fn create_network(&self) -> Result<Network> {
        info!(network = %self.spec.cluster_name, "Creating network");
        self.provider
            .create_network(&NetworkCreate {
                name: self.spec.cluster_name.clone(),
                ip_range: self.spec.ip_range.clone(),
                subnet_ip_range: self.spec.ip_range_subnet.clone(),
                network_zone: self.spec.network_zone.clone(),
                labels: self.spec.cluster_labels(),
            })
            .await
    }

    /// Create the firewall for one role of an existing cluster
    pub async fn create_firewall(&self, role: FirewallRole) -> Result<Firewall> {
        let request = firewall_request(&self.spec, role);
        info!(firewall = %request.name, apply_to = %request.apply_to, "Creating firewall");
        self.provider.create_firewall(&request).await
    }

    async fn create_ssh_key(&self) -> Result<SshKey> {
        info!(ssh_key = %self.spec.cluster_name, "Creating ssh key");
        let public_key = tokio::fs::read_to_string(&self.spec.ssh_public_key).await?;
        self.provider
            .create_ssh_key(&SshKeyCreate {
                name: self.spec.cluster_name.clone(),
                public_key,
                labels: self.spec.cluster_labels(),
            })
            .await
    }

    async fn create_load_balancer(&self, network: &Network) -> Result<LoadBalancer> {
        info!(load_balancer = %self.spec.cluster_name, "Creating load balancer");
        let settings = &self.spec.master_load_balancer;
        self.provider
            .create_load_balancer(&LoadBalancerCreate {
                name: self.spec.cluster_name.clone(),
                load_balancer_type: settings.load_balancer_type.clone(),
                location: self.spec.location.clone(),
                network_id: network.id,
                listen_port: settings.listen_port,
                destination_port: settings.destination_port,
                labels: self.spec.cluster_labels(),
            })
            .await
    }

    async fn create_servers(
        &self,
        network: &Network,
        ssh_key: &SshKey,
        load_balancer: &LoadBalancer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let masters = &self.spec.master_servers;

        info!(placement_group = %masters.placement_group_name, "Creating placement group");
        let placement_group = self
            .provider
            .create_placement_group(&PlacementGroupCreate {
                name: masters.placement_group_name.clone(),
                labels: self.spec.cluster_labels(),
            })
            .await?;

        for index in 1..=self.spec.master_count {
            let name = self.spec.master_name(index);
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!("create {}", name)));
            }
            let user_data = match self.spec.master_role(index) {
                ServerRole::FirstMaster => None,
                ServerRole::AdditionalMaster => {
                    Some(scripts::common_install(&masters.servers_init_params))
                }
                ServerRole::Worker => unreachable!("master_role never yields Worker"),
            };

            info!(server = %name, "Creating server");
            let server = self
                .provider
                .create_server(&ServerCreate {
                    name: name.clone(),
                    server_type: masters.server_type.clone(),
                    image: self.spec.server_image().to_string(),
                    datacenter: self.spec.datacenter.clone(),
                    ssh_key_id: ssh_key.id,
                    network_id: network.id,
                    placement_group_id: Some(placement_group.id),
                    user_data,
                    labels: self.spec.master_labels(),
                })
                .await?;

            let operation = format!("attach {} to load balancer", name);
            retry_bounded(self.poller.policy(), cancel, &operation, |_| {
                self.provider
                    .attach_server_to_load_balancer(load_balancer.id, server.id, true)
            })
            .await?;
        }

        Ok(())
    }

    /// Run control-plane init on the first master and fetch the join script
    /// and kubeconfig it produces
    async fn init_first_master(
        &self,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<ClusterCredentials> {
        let spec = self.spec.as_ref();
        let server = spec.first_master_name();
        let server = server.as_str();

        let ip = {
            let user = state.ssh_user.as_str();
            retry_bounded(self.poller.policy(), cancel, "init first master", |_| async move {
                let ip = self.poller.probe_server(server, user).await?;
                let load_balancer_ip = self.poller.probe_load_balancer(&spec.cluster_name).await?;

                info!(server = %server, load_balancer = %load_balancer_ip, "Running control-plane init");
                let command = scripts::init_master(
                    &spec.master_servers.servers_init_params,
                    &spec.hetzner_token,
                    &load_balancer_ip,
                );
                self.executor.execute(&ip, user, &command).await?;
                Ok(ip)
            })
            .await?
        };

        state.ssh_user = spec.server_components.ubuntu.user_name.clone();
        info!(server = %server, user = %state.ssh_user, "Control plane initialized, switching ssh user");

        let user = state.ssh_user.as_str();
        let ip = ip.as_str();
        let credentials = retry_bounded(
            self.poller.policy(),
            cancel,
            "fetch cluster credentials",
            |_| async move {
                let join = self.executor.execute(ip, user, scripts::READ_JOIN_SCRIPT).await?;
                let kubeconfig = self.executor.execute(ip, user, scripts::READ_KUBECONFIG).await?;
                Ok(ClusterCredentials {
                    master_cluster_join: join.stdout,
                    cluster_kube_config: kubeconfig.stdout,
                })
            },
        )
        .await?;

        state.credentials = Some(credentials.clone());
        Ok(credentials)
    }

    async fn join_master(
        &self,
        server: &str,
        user: &str,
        join_script: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(server = %server, "Joining master to control plane");
        let operation = format!("join {}", server);

        retry_bounded(self.poller.policy(), cancel, &operation, |_| async move {
            let ip = self.poller.probe_server(server, user).await?;
            self.executor.execute(&ip, user, join_script).await?;
            Ok(())
        })
        .await?;

        info!(server = %server, "Master joined");
        Ok(())
    }
}

/// Stop before `step` touches the provider once the run is cancelled
fn checkpoint(cancel: &CancellationToken, step: &'static str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Step {
            step,
            source: Box::new(Error::cancelled(step)),
        });
    }
    Ok(())
}

/// Write the kubeconfig readable by the owner only
pub async fn save_kubeconfig(path: &Path, contents: &str) -> Result<()> {
    info!(path = %path.display(), "Saving kubeconfig");

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

//! In-memory provider and shell for scenario tests
//!
//! [`FakeCloud`] keeps every resource kind in memory and applies label
//! selectors the same way the provider does. Servers get public addresses in
//! creation order (`198.51.100.1`, `198.51.100.2`, ...) and load balancers get
//! [`LOAD_BALANCER_IP`], so tests can target a host before it exists.
//!
//! [`FakeShell`] records every command and answers from scripted rules.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::ClusterSpec;
use crate::provider::{
    CloudProvider, Datacenter, Firewall, FirewallCreate, Labels, LoadBalancer, LoadBalancerCreate,
    Location, Network, NetworkCreate, PlacementGroup, PlacementGroupCreate, ResourceId, Server,
    ServerCreate, ServerType, SshKey, SshKeyCreate, Volume,
};
use crate::remote::{RemoteExecutor, RemoteOutput};
use crate::selector::LabelSelector;
use crate::{Error, RemoteError, Result};

/// Servers per page returned by [`FakeCloud::list_servers`]
pub const FAKE_PAGE_SIZE: usize = 2;

/// Public address of every load balancer created by [`FakeCloud`]
pub const LOAD_BALANCER_IP: &str = "203.0.113.10";

/// Spec with a short retry budget, zero delay and the given master count
///
/// Key and kubeconfig paths point into `dir`; the public key file is created.
pub fn test_spec(master_count: u32, dir: &Path) -> ClusterSpec {
    let mut spec = ClusterSpec::default();
    spec.hetzner_token = "test-token".to_string();
    spec.master_count = master_count;
    spec.ip_range_subnet = spec.ip_range.clone();
    spec.master_servers.retry_time_limit = 3;
    spec.master_servers.wait_time_in_retry = Duration::ZERO;
    spec.kube_config_path = dir.join("kube").join("config");
    spec.ssh_private_key = dir.join("id_ed25519");
    spec.ssh_public_key = dir.join("id_ed25519.pub");
    std::fs::write(&spec.ssh_public_key, "ssh-ed25519 AAAAC3Nza test@example\n")
        .expect("write public key");
    spec
}

/// Address [`FakeCloud`] assigns to the n-th created server (1-based)
pub fn server_ip(n: usize) -> String {
    format!("198.51.100.{}", n)
}

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Default)]
struct CloudState {
    next_id: ResourceId,
    servers_created: usize,
    locations: Vec<Location>,
    datacenters: Vec<Datacenter>,
    networks: Vec<Network>,
    ssh_keys: Vec<SshKey>,
    load_balancers: Vec<LoadBalancer>,
    placement_groups: Vec<PlacementGroup>,
    firewalls: Vec<Firewall>,
    servers: Vec<Server>,
    volumes: Vec<Volume>,
    attachments: Vec<(ResourceId, ResourceId)>,
    server_requests: Vec<ServerCreate>,
    failures: HashMap<&'static str, u32>,
    calls: Vec<String>,
}

impl CloudState {
    fn id(&mut self) -> ResourceId {
        self.next_id += 1;
        self.next_id
    }

    fn check(&mut self, operation: &'static str) -> Result<()> {
        match self.failures.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::provider(format!("injected {} failure", operation)))
            }
            _ => Ok(()),
        }
    }

    fn record(&mut self, operation: &str, name: &str) {
        self.calls.push(format!("{}:{}", operation, name));
    }
}

fn unique<T>(items: &[T], name: &str, get: impl Fn(&T) -> &str) -> Result<()> {
    if items.iter().any(|item| get(item) == name) {
        return Err(Error::provider(format!("uniqueness_error: {} already exists", name)));
    }
    Ok(())
}

fn remove<T>(
    items: &mut Vec<T>,
    id: ResourceId,
    get: impl Fn(&T) -> (ResourceId, String),
) -> Option<String> {
    let index = items.iter().position(|item| get(item).0 == id)?;
    Some(get(&items.remove(index)).1)
}

/// In-memory [`CloudProvider`]
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    /// Account with the default location and datacenter
    pub fn new() -> Self {
        let cloud = Self::default();
        cloud.seed_location("fsn1", "fsn1-dc14");
        cloud
    }

    /// Make the next `times` calls of `operation` fail
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.state.lock().failures.insert(operation, times);
    }

    /// Every mutating call made so far, as `operation:name`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Mutating calls that deleted something
    pub fn delete_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("delete_"))
            .collect()
    }

    /// Number of resources of every deletable kind
    pub fn resource_count(&self) -> usize {
        let state = self.state.lock();
        state.networks.len()
            + state.ssh_keys.len()
            + state.load_balancers.len()
            + state.placement_groups.len()
            + state.firewalls.len()
            + state.servers.len()
            + state.volumes.len()
    }

    /// Names of existing servers
    pub fn server_names(&self) -> Vec<String> {
        self.state.lock().servers.iter().map(|s| s.name.clone()).collect()
    }

    /// Names of existing firewalls
    pub fn firewall_names(&self) -> Vec<String> {
        self.state.lock().firewalls.iter().map(|f| f.name.clone()).collect()
    }

    /// Names of existing load balancers
    pub fn load_balancer_names(&self) -> Vec<String> {
        self.state
            .lock()
            .load_balancers
            .iter()
            .map(|l| l.name.clone())
            .collect()
    }

    /// Number of existing volumes
    pub fn volume_count(&self) -> usize {
        self.state.lock().volumes.len()
    }

    /// Server create requests in order
    pub fn server_requests(&self) -> Vec<ServerCreate> {
        self.state.lock().server_requests.clone()
    }

    /// `(load balancer id, server id)` target attachments
    pub fn attachments(&self) -> Vec<(ResourceId, ResourceId)> {
        self.state.lock().attachments.clone()
    }

    /// Add a location and a datacenter in it
    pub fn seed_location(&self, location: &str, datacenter: &str) {
        let mut state = self.state.lock();
        let location_id = state.id();
        let datacenter_id = state.id();
        state.locations.push(Location {
            id: location_id,
            name: location.to_string(),
            network_zone: "eu-central".to_string(),
        });
        state.datacenters.push(Datacenter {
            id: datacenter_id,
            name: datacenter.to_string(),
            location: location.to_string(),
        });
    }

    /// Add a server with the given labels and the next public address
    pub fn seed_server(&self, name: &str, pairs: &[(&str, &str)]) -> String {
        let mut state = self.state.lock();
        let id = state.id();
        state.servers_created += 1;
        let ip = server_ip(state.servers_created);
        state.servers.push(Server {
            id,
            name: name.to_string(),
            public_ipv4: Some(ip.clone()),
            labels: labels(pairs),
        });
        ip
    }

    /// Add a load balancer with the given labels
    pub fn seed_load_balancer(&self, name: &str, pairs: &[(&str, &str)]) {
        let mut state = self.state.lock();
        let id = state.id();
        state.load_balancers.push(LoadBalancer {
            id,
            name: name.to_string(),
            public_ipv4: Some(LOAD_BALANCER_IP.to_string()),
            labels: labels(pairs),
        });
    }

    /// Add a firewall with the given labels
    pub fn seed_firewall(&self, name: &str, pairs: &[(&str, &str)]) {
        let mut state = self.state.lock();
        let id = state.id();
        state.firewalls.push(Firewall {
            id,
            name: name.to_string(),
            labels: labels(pairs),
        });
    }

    /// Add a volume
    pub fn seed_volume(&self, name: &str) {
        let mut state = self.state.lock();
        let id = state.id();
        state.volumes.push(Volume {
            id,
            name: name.to_string(),
        });
    }

    /// Populate every resource kind the way a created cluster looks
    pub fn seed_cluster(&self, spec: &ClusterSpec) {
        let cluster = spec.cluster_labels();
        let mut state = self.state.lock();

        let id = state.id();
        state.networks.push(Network {
            id,
            name: spec.cluster_name.clone(),
            ip_range: spec.ip_range.clone(),
        });
        let id = state.id();
        state.ssh_keys.push(SshKey {
            id,
            name: spec.cluster_name.clone(),
        });
        let id = state.id();
        state.placement_groups.push(PlacementGroup {
            id,
            name: spec.master_servers.placement_group_name.clone(),
        });
        for suffix in ["controlplane", "workers"] {
            let id = state.id();
            state.firewalls.push(Firewall {
                id,
                name: format!("{}-{}", spec.cluster_name, suffix),
                labels: cluster.clone(),
            });
        }
        let id = state.id();
        state.load_balancers.push(LoadBalancer {
            id,
            name: spec.cluster_name.clone(),
            public_ipv4: Some(LOAD_BALANCER_IP.to_string()),
            labels: cluster.clone(),
        });
        drop(state);

        for i in 1..=spec.master_count {
            let pairs: Vec<(String, String)> = spec.master_labels().into_iter().collect();
            let refs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            self.seed_server(&spec.master_name(i), &refs);
        }
        self.seed_server("worker-a", &[("hcloud/node-group", "CX21:FSN1:cx21-fsn1")]);
        self.seed_server("worker-b", &[("hcloud/node-group", "CX21:FSN1:cx21-fsn1")]);
        self.seed_load_balancer("ingress", &[("hcloud-ccm/service-uid", "1234")]);
        self.seed_volume("pvc-1");
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn get_location(&self, name: &str) -> Result<Option<Location>> {
        let mut state = self.state.lock();
        state.check("get_location")?;
        Ok(state.locations.iter().find(|l| l.name == name).cloned())
    }

    async fn get_datacenter(&self, name: &str) -> Result<Option<Datacenter>> {
        let mut state = self.state.lock();
        state.check("get_datacenter")?;
        Ok(state.datacenters.iter().find(|d| d.name == name).cloned())
    }

    async fn list_locations(&self) -> Result<Vec<Location>> {
        let mut state = self.state.lock();
        state.check("list_locations")?;
        Ok(state.locations.clone())
    }

    async fn list_datacenters(&self) -> Result<Vec<Datacenter>> {
        let mut state = self.state.lock();
        state.check("list_datacenters")?;
        Ok(state.datacenters.clone())
    }

    async fn list_server_types(&self) -> Result<Vec<ServerType>> {
        let mut state = self.state.lock();
        state.check("list_server_types")?;
        Ok(vec![
            ServerType {
                id: 1,
                name: "cx21".to_string(),
            },
            ServerType {
                id: 2,
                name: "cpx31".to_string(),
            },
        ])
    }

    async fn get_network(&self, name: &str) -> Result<Option<Network>> {
        let mut state = self.state.lock();
        state.check("get_network")?;
        Ok(state.networks.iter().find(|n| n.name == name).cloned())
    }

    async fn create_network(&self, request: &NetworkCreate) -> Result<Network> {
        let mut state = self.state.lock();
        state.check("create_network")?;
        unique(&state.networks, &request.name, |n| n.name.as_str())?;
        let network = Network {
            id: state.id(),
            name: request.name.clone(),
            ip_range: request.ip_range.clone(),
        };
        state.networks.push(network.clone());
        state.record("create_network", &request.name);
        Ok(network)
    }

    async fn delete_network(&self, id: ResourceId) -> Result<()> {
        let mut state = self.state.lock();
        state.check("delete_network")?;
        let name = remove(&mut state.networks, id, |n| (n.id, n.name.clone())).unwrap_or_default();
        state.record("delete_network", &name);
        Ok(())
    }

    async fn get_ssh_key(&self, name: &str) -> Result<Option<SshKey>> {
        let mut state = self.state.lock();
        state.check("get_ssh_key")?;
        Ok(state.ssh_keys.iter().find(|k| k.name == name).cloned())
    }

    async fn create_ssh_key(&self, request: &SshKeyCreate) -> Result<SshKey> {
        let mut state = self.state.lock();
        state.check("create_ssh_key")?;
        unique(&state.ssh_keys, &request.name, |k| k.name.as_str())?;
        let key = SshKey {
            id: state.id(),
            name: request.name.clone(),
        };
        state.ssh_keys.push(key.clone());
        state.record("create_ssh_key", &request.name);
        Ok(key)
    }

    async fn delete_ssh_key(&self, id: ResourceId) -> Result<()> {
        let mut state = self.state.lock();
        state.check("delete_ssh_key")?;
        let name = remove(&mut state.ssh_keys, id, |k| (k.id, k.name.clone())).unwrap_or_default();
        state.record("delete_ssh_key", &name);
        Ok(())
    }

    async fn get_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>> {
        let mut state = self.state.lock();
        state.check("get_load_balancer")?;
        Ok(state.load_balancers.iter().find(|l| l.name == name).cloned())
    }

    async fn list_load_balancers(&self, selector: &LabelSelector) -> Result<Vec<LoadBalancer>> {
        let mut state = self.state.lock();
        state.check("list_load_balancers")?;
        Ok(state
            .load_balancers
            .iter()
            .filter(|l| selector.matches(&l.labels))
            .cloned()
            .collect())
    }

    async fn create_load_balancer(&self, request: &LoadBalancerCreate) -> Result<LoadBalancer> {
        let mut state = self.state.lock();
        state.check("create_load_balancer")?;
        unique(&state.load_balancers, &request.name, |l| l.name.as_str())?;
        let load_balancer = LoadBalancer {
            id: state.id(),
            name: request.name.clone(),
            public_ipv4: Some(LOAD_BALANCER_IP.to_string()),
            labels: request.labels.clone(),
        };
        state.load_balancers.push(load_balancer.clone());
        state.record("create_load_balancer", &request.name);
        Ok(load_balancer)
    }

    async fn attach_server_to_load_balancer(
        &self,
        load_balancer_id: ResourceId,
        server_id: ResourceId,
        _use_private_ip: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.check("attach_server_to_load_balancer")?;
        state.attachments.push((load_balancer_id, server_id));
        Ok(())
    }

    async fn delete_load_balancer(&self, id: ResourceId) -> Result<()> {
        let mut state = self.state.lock();
        state.check("delete_load_balancer")?;
        let name =
            remove(&mut state.load_balancers, id, |l| (l.id, l.name.clone())).unwrap_or_default();
        state.record("delete_load_balancer", &name);
        Ok(())
    }

    async fn get_placement_group(&self, name: &str) -> Result<Option<PlacementGroup>> {
        let mut state = self.state.lock();
        state.check("get_placement_group")?;
        Ok(state.placement_groups.iter().find(|p| p.name == name).cloned())
    }

    async fn create_placement_group(
        &self,
        request: &PlacementGroupCreate,
    ) -> Result<PlacementGroup> {
        let mut state = self.state.lock();
        state.check("create_placement_group")?;
        unique(&state.placement_groups, &request.name, |p| p.name.as_str())?;
        let group = PlacementGroup {
            id: state.id(),
            name: request.name.clone(),
        };
        state.placement_groups.push(group.clone());
        state.record("create_placement_group", &request.name);
        Ok(group)
    }

    async fn delete_placement_group(&self, id: ResourceId) -> Result<()> {
        let mut state = self.state.lock();
        state.check("delete_placement_group")?;
        let name = remove(&mut state.placement_groups, id, |p| (p.id, p.name.clone()))
            .unwrap_or_default();
        state.record("delete_placement_group", &name);
        Ok(())
    }

    async fn list_firewalls(&self, selector: &LabelSelector) -> Result<Vec<Firewall>> {
        let mut state = self.state.lock();
        state.check("list_firewalls")?;
        Ok(state
            .firewalls
            .iter()
            .filter(|f| selector.matches(&f.labels))
            .cloned()
            .collect())
    }

    async fn create_firewall(&self, request: &FirewallCreate) -> Result<Firewall> {
        let mut state = self.state.lock();
        state.check("create_firewall")?;
        unique(&state.firewalls, &request.name, |f| f.name.as_str())?;
        let firewall = Firewall {
            id: state.id(),
            name: request.name.clone(),
            labels: request.labels.clone(),
        };
        state.firewalls.push(firewall.clone());
        state.record("create_firewall", &request.name);
        Ok(firewall)
    }

    async fn delete_firewall(&self, id: ResourceId) -> Result<()> {
        let mut state = self.state.lock();
        state.check("delete_firewall")?;
        let name = remove(&mut state.firewalls, id, |f| (f.id, f.name.clone())).unwrap_or_default();
        state.record("delete_firewall", &name);
        Ok(())
    }

    async fn get_server(&self, name: &str) -> Result<Option<Server>> {
        let mut state = self.state.lock();
        state.check("get_server")?;
        Ok(state.servers.iter().find(|s| s.name == name).cloned())
    }

    async fn list_servers(&self, selector: &LabelSelector, page: u32) -> Result<Vec<Server>> {
        let mut state = self.state.lock();
        state.check("list_servers")?;
        let skip = (page.max(1) as usize - 1) * FAKE_PAGE_SIZE;
        Ok(state
            .servers
            .iter()
            .filter(|s| selector.matches(&s.labels))
            .skip(skip)
            .take(FAKE_PAGE_SIZE)
            .cloned()
            .collect())
    }

    async fn create_server(&self, request: &ServerCreate) -> Result<Server> {
        let mut state = self.state.lock();
        state.check("create_server")?;
        unique(&state.servers, &request.name, |s| s.name.as_str())?;
        state.servers_created += 1;
        let server = Server {
            id: state.id(),
            name: request.name.clone(),
            public_ipv4: Some(server_ip(state.servers_created)),
            labels: request.labels.clone(),
        };
        state.servers.push(server.clone());
        state.server_requests.push(request.clone());
        state.record("create_server", &request.name);
        Ok(server)
    }

    async fn delete_server(&self, id: ResourceId) -> Result<()> {
        let mut state = self.state.lock();
        state.check("delete_server")?;
        let name = remove(&mut state.servers, id, |s| (s.id, s.name.clone())).unwrap_or_default();
        state.record("delete_server", &name);
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let mut state = self.state.lock();
        state.check("list_volumes")?;
        Ok(state.volumes.clone())
    }

    async fn delete_volume(&self, id: ResourceId) -> Result<()> {
        let mut state = self.state.lock();
        state.check("delete_volume")?;
        let name = remove(&mut state.volumes, id, |v| (v.id, v.name.clone())).unwrap_or_default();
        state.record("delete_volume", &name);
        Ok(())
    }
}

/// A command recorded by [`FakeShell`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCall {
    /// Target address
    pub address: String,
    /// Principal
    pub user: String,
    /// Raw command
    pub command: String,
}

struct FailRule {
    address: Option<String>,
    contains: String,
    remaining: Option<u32>,
}

#[derive(Default)]
struct ShellState {
    calls: Vec<ShellCall>,
    failures: Vec<FailRule>,
    responses: Vec<(String, String)>,
}

/// Scripted [`RemoteExecutor`]
#[derive(Default)]
pub struct FakeShell {
    state: Mutex<ShellState>,
}

impl FakeShell {
    /// Shell where every command succeeds with empty output
    pub fn new() -> Self {
        Self::default()
    }

    /// Shell answering the credential reads the first master serves
    pub fn with_first_master_files() -> Self {
        let shell = Self::new();
        shell.respond(
            crate::scripts::READ_JOIN_SCRIPT,
            "kubeadm join 203.0.113.10:6443 --control-plane\n",
        );
        shell.respond(crate::scripts::READ_KUBECONFIG, "apiVersion: v1\nkind: Config\n");
        shell
    }

    /// Commands containing `contains` succeed with `stdout`
    pub fn respond(&self, contains: &str, stdout: &str) {
        self.state
            .lock()
            .responses
            .push((contains.to_string(), stdout.to_string()));
    }

    /// Commands containing `contains` (on `address`, if given) fail; `times`
    /// limits how often, `None` fails forever
    pub fn fail(&self, address: Option<&str>, contains: &str, times: Option<u32>) {
        self.state.lock().failures.push(FailRule {
            address: address.map(str::to_string),
            contains: contains.to_string(),
            remaining: times,
        });
    }

    /// Every command executed so far
    pub fn calls(&self) -> Vec<ShellCall> {
        self.state.lock().calls.clone()
    }

    /// Executed commands containing `contains`
    pub fn calls_containing(&self, contains: &str) -> Vec<ShellCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.command.contains(contains))
            .collect()
    }
}

#[async_trait]
impl RemoteExecutor for FakeShell {
    async fn execute(&self, address: &str, user: &str, command: &str) -> Result<RemoteOutput> {
        let mut state = self.state.lock();
        state.calls.push(ShellCall {
            address: address.to_string(),
            user: user.to_string(),
            command: command.to_string(),
        });

        let failing = state.failures.iter_mut().find(|rule| {
            command.contains(&rule.contains)
                && rule.address.as_deref().map_or(true, |a| a == address)
                && rule.remaining != Some(0)
        });
        if let Some(rule) = failing {
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(RemoteError::NonZeroExit {
                address: address.to_string(),
                status: 1,
                stdout: String::new(),
                stderr: format!("scripted failure: {}", rule.contains),
            }
            .into());
        }

        let stdout = state
            .responses
            .iter()
            .find(|(contains, _)| command.contains(contains.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default();

        Ok(RemoteOutput {
            stdout,
            stderr: String::new(),
        })
    }
}

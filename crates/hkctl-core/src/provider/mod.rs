//! Cloud provider abstraction
//!
//! [`CloudProvider`] is the narrow set of CRUD and list operations the
//! orchestrator needs per resource kind. Lookups by name return `Ok(None)`
//! when the resource does not exist; "not found" is never an error.
//!
//! The production implementation is [`HcloudClient`]. Tests use the mockall
//! generated `MockCloudProvider` or the in-memory fake in `crate::testing`.

mod hcloud;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

pub use hcloud::{HcloudClient, HCLOUD_API_URL};

use crate::selector::LabelSelector;
use crate::Result;

/// Provider-assigned resource id
pub type ResourceId = i64;

/// Labels attached to a provider resource
pub type Labels = BTreeMap<String, String>;

// =============================================================================
// Resources
// =============================================================================

/// A provider location (e.g. `fsn1`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Location {
    /// Provider id
    pub id: ResourceId,
    /// Location name
    pub name: String,
    /// Network zone the location belongs to
    pub network_zone: String,
}

/// A provider datacenter (e.g. `fsn1-dc14`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Datacenter {
    /// Provider id
    pub id: ResourceId,
    /// Datacenter name
    pub name: String,
    /// Name of the location it is in
    pub location: String,
}

/// A purchasable server type (e.g. `cx21`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerType {
    /// Provider id
    pub id: ResourceId,
    /// Server type name
    pub name: String,
}

/// A private network
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Network {
    /// Provider id
    pub id: ResourceId,
    /// Network name
    pub name: String,
    /// Network range
    pub ip_range: String,
}

/// An uploaded SSH public key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshKey {
    /// Provider id
    pub id: ResourceId,
    /// Key name
    pub name: String,
}

/// A load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancer {
    /// Provider id
    pub id: ResourceId,
    /// Load balancer name
    pub name: String,
    /// Public IPv4 address, once assigned
    pub public_ipv4: Option<String>,
    /// Labels
    pub labels: Labels,
}

/// An anti-affinity placement group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementGroup {
    /// Provider id
    pub id: ResourceId,
    /// Group name
    pub name: String,
}

/// A firewall
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Firewall {
    /// Provider id
    pub id: ResourceId,
    /// Firewall name
    pub name: String,
    /// Labels
    pub labels: Labels,
}

/// A compute server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Server {
    /// Provider id
    pub id: ResourceId,
    /// Server name
    pub name: String,
    /// Public IPv4 address, once assigned
    pub public_ipv4: Option<String>,
    /// Labels
    pub labels: Labels,
}

/// A block storage volume
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Volume {
    /// Provider id
    pub id: ResourceId,
    /// Volume name
    pub name: String,
}

// =============================================================================
// Create requests
// =============================================================================

/// Network with a single server subnet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkCreate {
    /// Network name
    pub name: String,
    /// Network range
    pub ip_range: String,
    /// Server subnet range, within `ip_range`
    pub subnet_ip_range: String,
    /// Network zone of the subnet
    pub network_zone: String,
    /// Labels
    pub labels: Labels,
}

/// SSH key upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshKeyCreate {
    /// Key name
    pub name: String,
    /// OpenSSH public key text
    pub public_key: String,
    /// Labels
    pub labels: Labels,
}

/// Load balancer with one TCP service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerCreate {
    /// Load balancer name
    pub name: String,
    /// Provider load balancer type
    pub load_balancer_type: String,
    /// Location name
    pub location: String,
    /// Private network to attach to
    pub network_id: ResourceId,
    /// Public port
    pub listen_port: u16,
    /// Target port, also health checked over HTTPS at `/healthz`
    pub destination_port: u16,
    /// Labels
    pub labels: Labels,
}

/// Spread placement group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementGroupCreate {
    /// Group name
    pub name: String,
    /// Labels
    pub labels: Labels,
}

/// Traffic direction of a firewall rule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Inbound
    In,
}

/// Protocol of a firewall rule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

/// A single inbound firewall rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FirewallRule {
    /// Direction
    pub direction: Direction,
    /// Protocol
    pub protocol: Protocol,
    /// Port or range (`6443`, `2379-2380`)
    pub port: String,
    /// Allowed source CIDRs
    pub source_ips: Vec<String>,
    /// Human readable purpose
    pub description: String,
}

/// Firewall applied to servers matching a label selector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallCreate {
    /// Firewall name
    pub name: String,
    /// Labels
    pub labels: Labels,
    /// Inbound rules
    pub rules: Vec<FirewallRule>,
    /// Servers the firewall applies to
    pub apply_to: LabelSelector,
}

/// Server creation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerCreate {
    /// Server name
    pub name: String,
    /// Provider server type
    pub server_type: String,
    /// Image name
    pub image: String,
    /// Datacenter name
    pub datacenter: String,
    /// Uploaded SSH key
    pub ssh_key_id: ResourceId,
    /// Private network
    pub network_id: ResourceId,
    /// Placement group, if any
    pub placement_group_id: Option<ResourceId>,
    /// Cloud-init user data, if any
    pub user_data: Option<String>,
    /// Labels
    pub labels: Labels,
}

// =============================================================================
// Provider trait
// =============================================================================

/// CRUD and list operations against the cloud provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Look up a location by name
    async fn get_location(&self, name: &str) -> Result<Option<Location>>;

    /// Look up a datacenter by name
    async fn get_datacenter(&self, name: &str) -> Result<Option<Datacenter>>;

    /// All locations
    async fn list_locations(&self) -> Result<Vec<Location>>;

    /// All datacenters
    async fn list_datacenters(&self) -> Result<Vec<Datacenter>>;

    /// All server types
    async fn list_server_types(&self) -> Result<Vec<ServerType>>;

    /// Look up a network by name
    async fn get_network(&self, name: &str) -> Result<Option<Network>>;

    /// Create a network and its server subnet
    async fn create_network(&self, request: &NetworkCreate) -> Result<Network>;

    /// Delete a network
    async fn delete_network(&self, id: ResourceId) -> Result<()>;

    /// Look up an SSH key by name
    async fn get_ssh_key(&self, name: &str) -> Result<Option<SshKey>>;

    /// Upload an SSH key
    async fn create_ssh_key(&self, request: &SshKeyCreate) -> Result<SshKey>;

    /// Delete an SSH key
    async fn delete_ssh_key(&self, id: ResourceId) -> Result<()>;

    /// Look up a load balancer by name
    async fn get_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>>;

    /// Load balancers matching a selector
    async fn list_load_balancers(&self, selector: &LabelSelector) -> Result<Vec<LoadBalancer>>;

    /// Create a load balancer
    async fn create_load_balancer(&self, request: &LoadBalancerCreate) -> Result<LoadBalancer>;

    /// Add a server as a load balancer target
    async fn attach_server_to_load_balancer(
        &self,
        load_balancer_id: ResourceId,
        server_id: ResourceId,
        use_private_ip: bool,
    ) -> Result<()>;

    /// Delete a load balancer
    async fn delete_load_balancer(&self, id: ResourceId) -> Result<()>;

    /// Look up a placement group by name
    async fn get_placement_group(&self, name: &str) -> Result<Option<PlacementGroup>>;

    /// Create a spread placement group
    async fn create_placement_group(
        &self,
        request: &PlacementGroupCreate,
    ) -> Result<PlacementGroup>;

    /// Delete a placement group
    async fn delete_placement_group(&self, id: ResourceId) -> Result<()>;

    /// Firewalls matching a selector
    async fn list_firewalls(&self, selector: &LabelSelector) -> Result<Vec<Firewall>>;

    /// Create a firewall
    async fn create_firewall(&self, request: &FirewallCreate) -> Result<Firewall>;

    /// Delete a firewall
    async fn delete_firewall(&self, id: ResourceId) -> Result<()>;

    /// Look up a server by name
    async fn get_server(&self, name: &str) -> Result<Option<Server>>;

    /// One page (1-based) of servers matching a selector
    async fn list_servers(&self, selector: &LabelSelector, page: u32) -> Result<Vec<Server>>;

    /// Create and start a server
    async fn create_server(&self, request: &ServerCreate) -> Result<Server>;

    /// Delete a server
    async fn delete_server(&self, id: ResourceId) -> Result<()>;

    /// All volumes in the account
    async fn list_volumes(&self) -> Result<Vec<Volume>>;

    /// Delete a volume
    async fn delete_volume(&self, id: ResourceId) -> Result<()>;
}

/// Every server matching `selector`, reading pages until one comes back empty
pub async fn list_all_servers(
    provider: &dyn CloudProvider,
    selector: &LabelSelector,
) -> Result<Vec<Server>> {
    let mut servers = Vec::new();
    let mut page = 1;

    loop {
        let batch = provider.list_servers(selector, page).await?;
        if batch.is_empty() {
            return Ok(servers);
        }
        servers.extend(batch);
        page += 1;
    }
}

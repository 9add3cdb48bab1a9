//! Hetzner Cloud REST client
//!
//! Thin mapping of [`CloudProvider`] onto the public v1 API. Request bodies
//! are built by free functions so their shape can be checked without a server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    CloudProvider, Datacenter, Firewall, FirewallCreate, Labels, LoadBalancer,
    LoadBalancerCreate, Location, Network, NetworkCreate, PlacementGroup, PlacementGroupCreate,
    ResourceId, Server, ServerCreate, ServerType, SshKey, SshKeyCreate, Volume,
};
use crate::selector::LabelSelector;
use crate::{Error, Result};

/// Production API endpoint
pub const HCLOUD_API_URL: &str = "https://api.hetzner.cloud/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PER_PAGE: u32 = 50;

/// [`CloudProvider`] backed by the Hetzner Cloud API
pub struct HcloudClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HcloudClient {
    /// Client for the production endpoint
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, HCLOUD_API_URL)
    }

    /// Client for an alternative endpoint
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("hcloud-k8s-ctl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "Provider request");

        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(Some(Value::Null));
        }

        let text = response.text().await?;
        if !status.is_success() {
            return Err(api_error(status, &text));
        }

        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| Error::serialization(format!("invalid response from {}: {}", path, e)))
    }

    async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        key: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        match self.request(Method::GET, path, query, None).await? {
            Some(body) => take_field(body, key),
            None => Ok(Vec::new()),
        }
    }

    async fn list_all<T: DeserializeOwned>(&self, path: &str, key: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1u32;
        loop {
            let batch: Vec<T> = self.list(path, key, &page_query(page)).await?;
            if batch.is_empty() {
                return Ok(items);
            }
            items.extend(batch);
            page += 1;
        }
    }

    async fn find<T: DeserializeOwned>(&self, path: &str, key: &str, name: &str) -> Result<Option<T>> {
        let items: Vec<T> = self
            .list(path, key, &[("name", name.to_string())])
            .await?;
        Ok(items.into_iter().next())
    }

    async fn create<T: DeserializeOwned>(&self, path: &str, key: &str, body: &Value) -> Result<T> {
        let response = self
            .request(Method::POST, path, &[], Some(body))
            .await?
            .ok_or_else(|| Error::provider(format!("{} returned not found", path)))?;
        take_field(response, key)
    }

    /// Delete if it exists; a missing resource counts as deleted
    async fn delete(&self, path: &str) -> Result<()> {
        self.request(Method::DELETE, path, &[], None).await?;
        Ok(())
    }
}

fn page_query(page: u32) -> Vec<(&'static str, String)> {
    vec![("page", page.to_string()), ("per_page", PER_PAGE.to_string())]
}

fn selector_query(selector: &LabelSelector) -> Vec<(&'static str, String)> {
    if selector.is_empty() {
        Vec::new()
    } else {
        vec![("label_selector", selector.to_string())]
    }
}

fn take_field<T: DeserializeOwned>(mut body: Value, key: &str) -> Result<T> {
    let field = body
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| Error::serialization(format!("response has no '{}' field", key)))?;
    serde_json::from_value(field).map_err(|e| Error::serialization(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    code: String,
    message: String,
}

fn api_error(status: StatusCode, body: &str) -> Error {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => Error::provider(format!(
            "{} ({}): {}",
            parsed.error.code,
            status.as_u16(),
            parsed.error.message
        )),
        Err(_) => Error::provider(format!("unexpected status {}: {}", status, body.trim())),
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiNamed {
    id: ResourceId,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    id: ResourceId,
    name: String,
    network_zone: String,
}

#[derive(Debug, Deserialize)]
struct ApiDatacenter {
    id: ResourceId,
    name: String,
    location: ApiNamed,
}

#[derive(Debug, Deserialize)]
struct ApiNetwork {
    id: ResourceId,
    name: String,
    ip_range: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiPublicNet {
    #[serde(default)]
    ipv4: Option<ApiIpv4>,
}

#[derive(Debug, Deserialize)]
struct ApiIpv4 {
    #[serde(default)]
    ip: Option<String>,
}

impl ApiPublicNet {
    fn ipv4(self) -> Option<String> {
        self.ipv4.and_then(|v4| v4.ip).filter(|ip| !ip.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct ApiLabelled {
    id: ResourceId,
    name: String,
    #[serde(default)]
    public_net: Option<ApiPublicNet>,
    #[serde(default)]
    labels: Labels,
}

impl From<ApiNamed> for ServerType {
    fn from(api: ApiNamed) -> Self {
        Self { id: api.id, name: api.name }
    }
}

impl From<ApiNamed> for SshKey {
    fn from(api: ApiNamed) -> Self {
        Self { id: api.id, name: api.name }
    }
}

impl From<ApiNamed> for PlacementGroup {
    fn from(api: ApiNamed) -> Self {
        Self { id: api.id, name: api.name }
    }
}

impl From<ApiNamed> for Volume {
    fn from(api: ApiNamed) -> Self {
        Self { id: api.id, name: api.name }
    }
}

impl From<ApiLocation> for Location {
    fn from(api: ApiLocation) -> Self {
        Self {
            id: api.id,
            name: api.name,
            network_zone: api.network_zone,
        }
    }
}

impl From<ApiDatacenter> for Datacenter {
    fn from(api: ApiDatacenter) -> Self {
        Self {
            id: api.id,
            name: api.name,
            location: api.location.name,
        }
    }
}

impl From<ApiNetwork> for Network {
    fn from(api: ApiNetwork) -> Self {
        Self {
            id: api.id,
            name: api.name,
            ip_range: api.ip_range,
        }
    }
}

impl From<ApiLabelled> for LoadBalancer {
    fn from(api: ApiLabelled) -> Self {
        Self {
            id: api.id,
            name: api.name,
            public_ipv4: api.public_net.and_then(ApiPublicNet::ipv4),
            labels: api.labels,
        }
    }
}

impl From<ApiLabelled> for Server {
    fn from(api: ApiLabelled) -> Self {
        Self {
            id: api.id,
            name: api.name,
            public_ipv4: api.public_net.and_then(ApiPublicNet::ipv4),
            labels: api.labels,
        }
    }
}

impl From<ApiLabelled> for Firewall {
    fn from(api: ApiLabelled) -> Self {
        Self {
            id: api.id,
            name: api.name,
            labels: api.labels,
        }
    }
}

fn convert<A, T: From<A>>(items: Vec<A>) -> Vec<T> {
    items.into_iter().map(T::from).collect()
}

// =============================================================================
// Request bodies
// =============================================================================

fn network_body(request: &NetworkCreate) -> Value {
    json!({
        "name": request.name,
        "ip_range": request.ip_range,
        "labels": request.labels,
        "subnets": [{
            "type": "server",
            "ip_range": request.subnet_ip_range,
            "network_zone": request.network_zone,
        }],
    })
}

fn ssh_key_body(request: &SshKeyCreate) -> Value {
    json!({
        "name": request.name,
        "public_key": request.public_key.trim(),
        "labels": request.labels,
    })
}

fn load_balancer_body(request: &LoadBalancerCreate) -> Value {
    json!({
        "name": request.name,
        "load_balancer_type": request.load_balancer_type,
        "location": request.location,
        "network": request.network_id,
        "labels": request.labels,
        "services": [{
            "protocol": "tcp",
            "listen_port": request.listen_port,
            "destination_port": request.destination_port,
            "proxyprotocol": false,
            "health_check": {
                "protocol": "http",
                "port": request.destination_port,
                "interval": 15,
                "timeout": 10,
                "retries": 3,
                "http": {
                    "path": "/healthz",
                    "tls": true,
                    "status_codes": ["2??", "3??"],
                },
            },
        }],
    })
}

fn placement_group_body(request: &PlacementGroupCreate) -> Value {
    json!({
        "name": request.name,
        "type": "spread",
        "labels": request.labels,
    })
}

fn firewall_body(request: &FirewallCreate) -> Value {
    json!({
        "name": request.name,
        "labels": request.labels,
        "rules": request.rules,
        "apply_to": [{
            "type": "label_selector",
            "label_selector": { "selector": request.apply_to.to_string() },
        }],
    })
}

fn server_body(request: &ServerCreate) -> Value {
    let mut body = json!({
        "name": request.name,
        "server_type": request.server_type,
        "image": request.image,
        "datacenter": request.datacenter,
        "ssh_keys": [request.ssh_key_id],
        "networks": [request.network_id],
        "labels": request.labels,
        "start_after_create": true,
    });
    if let Some(id) = request.placement_group_id {
        body["placement_group"] = json!(id);
    }
    if let Some(user_data) = &request.user_data {
        body["user_data"] = json!(user_data);
    }
    body
}

fn attach_target_body(server_id: ResourceId, use_private_ip: bool) -> Value {
    json!({
        "type": "server",
        "server": { "id": server_id },
        "use_private_ip": use_private_ip,
    })
}

#[async_trait]
impl CloudProvider for HcloudClient {
    async fn get_location(&self, name: &str) -> Result<Option<Location>> {
        let found: Option<ApiLocation> = self.find("/locations", "locations", name).await?;
        Ok(found.map(Location::from))
    }

    async fn get_datacenter(&self, name: &str) -> Result<Option<Datacenter>> {
        let found: Option<ApiDatacenter> = self.find("/datacenters", "datacenters", name).await?;
        Ok(found.map(Datacenter::from))
    }

    async fn list_locations(&self) -> Result<Vec<Location>> {
        let items: Vec<ApiLocation> = self.list_all("/locations", "locations").await?;
        Ok(convert(items))
    }

    async fn list_datacenters(&self) -> Result<Vec<Datacenter>> {
        let items: Vec<ApiDatacenter> = self.list_all("/datacenters", "datacenters").await?;
        Ok(convert(items))
    }

    async fn list_server_types(&self) -> Result<Vec<ServerType>> {
        let items: Vec<ApiNamed> = self.list_all("/server_types", "server_types").await?;
        Ok(convert(items))
    }

    async fn get_network(&self, name: &str) -> Result<Option<Network>> {
        let found: Option<ApiNetwork> = self.find("/networks", "networks", name).await?;
        Ok(found.map(Network::from))
    }

    async fn create_network(&self, request: &NetworkCreate) -> Result<Network> {
        let created: ApiNetwork = self
            .create("/networks", "network", &network_body(request))
            .await?;
        Ok(created.into())
    }

    async fn delete_network(&self, id: ResourceId) -> Result<()> {
        self.delete(&format!("/networks/{}", id)).await
    }

    async fn get_ssh_key(&self, name: &str) -> Result<Option<SshKey>> {
        let found: Option<ApiNamed> = self.find("/ssh_keys", "ssh_keys", name).await?;
        Ok(found.map(SshKey::from))
    }

    async fn create_ssh_key(&self, request: &SshKeyCreate) -> Result<SshKey> {
        let created: ApiNamed = self
            .create("/ssh_keys", "ssh_key", &ssh_key_body(request))
            .await?;
        Ok(created.into())
    }

    async fn delete_ssh_key(&self, id: ResourceId) -> Result<()> {
        self.delete(&format!("/ssh_keys/{}", id)).await
    }

    async fn get_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>> {
        let found: Option<ApiLabelled> = self
            .find("/load_balancers", "load_balancers", name)
            .await?;
        Ok(found.map(LoadBalancer::from))
    }

    async fn list_load_balancers(&self, selector: &LabelSelector) -> Result<Vec<LoadBalancer>> {
        let items: Vec<ApiLabelled> = self
            .list("/load_balancers", "load_balancers", &selector_query(selector))
            .await?;
        Ok(convert(items))
    }

    async fn create_load_balancer(&self, request: &LoadBalancerCreate) -> Result<LoadBalancer> {
        let created: ApiLabelled = self
            .create("/load_balancers", "load_balancer", &load_balancer_body(request))
            .await?;
        Ok(created.into())
    }

    async fn attach_server_to_load_balancer(
        &self,
        load_balancer_id: ResourceId,
        server_id: ResourceId,
        use_private_ip: bool,
    ) -> Result<()> {
        let path = format!("/load_balancers/{}/actions/add_target", load_balancer_id);
        let body = attach_target_body(server_id, use_private_ip);
        self.request(Method::POST, &path, &[], Some(&body))
            .await?
            .ok_or_else(|| Error::provider(format!("load balancer {} not found", load_balancer_id)))?;
        Ok(())
    }

    async fn delete_load_balancer(&self, id: ResourceId) -> Result<()> {
        self.delete(&format!("/load_balancers/{}", id)).await
    }

    async fn get_placement_group(&self, name: &str) -> Result<Option<PlacementGroup>> {
        let found: Option<ApiNamed> = self
            .find("/placement_groups", "placement_groups", name)
            .await?;
        Ok(found.map(PlacementGroup::from))
    }

    async fn create_placement_group(
        &self,
        request: &PlacementGroupCreate,
    ) -> Result<PlacementGroup> {
        let created: ApiNamed = self
            .create("/placement_groups", "placement_group", &placement_group_body(request))
            .await?;
        Ok(created.into())
    }

    async fn delete_placement_group(&self, id: ResourceId) -> Result<()> {
        self.delete(&format!("/placement_groups/{}", id)).await
    }

    async fn list_firewalls(&self, selector: &LabelSelector) -> Result<Vec<Firewall>> {
        let items: Vec<ApiLabelled> = self
            .list("/firewalls", "firewalls", &selector_query(selector))
            .await?;
        Ok(convert(items))
    }

    async fn create_firewall(&self, request: &FirewallCreate) -> Result<Firewall> {
        let created: ApiLabelled = self
            .create("/firewalls", "firewall", &firewall_body(request))
            .await?;
        Ok(created.into())
    }

    async fn delete_firewall(&self, id: ResourceId) -> Result<()> {
        self.delete(&format!("/firewalls/{}", id)).await
    }

    async fn get_server(&self, name: &str) -> Result<Option<Server>> {
        let found: Option<ApiLabelled> = self.find("/servers", "servers", name).await?;
        Ok(found.map(Server::from))
    }

    async fn list_servers(&self, selector: &LabelSelector, page: u32) -> Result<Vec<Server>> {
        let mut query = selector_query(selector);
        query.extend(page_query(page));
        let items: Vec<ApiLabelled> = self.list("/servers", "servers", &query).await?;
        Ok(convert(items))
    }

    async fn create_server(&self, request: &ServerCreate) -> Result<Server> {
        let created: ApiLabelled = self
            .create("/servers", "server", &server_body(request))
            .await?;
        Ok(created.into())
    }

    async fn delete_server(&self, id: ResourceId) -> Result<()> {
        self.delete(&format!("/servers/{}", id)).await
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let items: Vec<ApiNamed> = self.list_all("/volumes", "volumes").await?;
        Ok(convert(items))
    }

    async fn delete_volume(&self, id: ResourceId) -> Result<()> {
        self.delete(&format!("/volumes/{}", id)).await
    }
}

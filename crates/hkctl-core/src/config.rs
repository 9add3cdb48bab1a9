//! Cluster configuration
//!
//! [`ClusterSpec`] is the fully resolved description of one cluster. It is
//! loaded once from YAML, validated, wrapped in an `Arc` and handed to every
//! component at construction time. Keys are camelCase so existing config
//! files keep working; unknown top-level keys are treated as helm chart values
//! and passed through to the post-install payload untouched.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::retry::RetryPolicy;
use crate::selector::{LabelSelector, CLUSTER_LABEL};
use crate::{Error, Result};

/// Environment variable consulted when the config has no token
pub const TOKEN_ENV: &str = "HCLOUD_TOKEN";

/// File in the working directory consulted after [`TOKEN_ENV`]
pub const TOKEN_FILE: &str = ".hcloudauth";

/// Placeholder used in place of the token in printed configs
pub const SECRET_PLACEHOLDER: &str = "<secret>";

/// Keys omitted from `save-full-config` output
pub const LOCAL_ONLY_KEYS: [&str; 4] = [
    "kubeConfigPath",
    "hetznerToken",
    "sshPrivateKey",
    "sshPublicKey",
];

const DEFAULT_MASTER_COUNT: u32 = 3;
const DEFAULT_WORKERS_MAX: u32 = 20;
const DEFAULT_API_PORT: u16 = 6443;
const DEFAULT_RETRY_LIMIT: u32 = 20;
const DEFAULT_WAIT: Duration = Duration::from_secs(3);
const DEFAULT_LOCATIONS: [&str; 3] = ["fsn1", "nbg1", "hel1"];
const DEFAULT_AUTOSCALER_INSTANCES: [&str; 9] = [
    "cpx11", "cpx21", "cx22", "cpx31", "cx32", "cpx41", "cx42", "cx52", "cpx51",
];

/// Key under which autoscaler chart values live
pub const CLUSTER_AUTOSCALER_KEY: &str = "cluster-autoscaler";

/// Role a server plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerRole {
    /// Runs `kubeadm init`, produces the join script and the admin kubeconfig
    FirstMaster,
    /// Joins the control plane with the first master's join script
    AdditionalMaster,
    /// Autoscaler-managed worker
    Worker,
}

/// Complete, resolved cluster configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSpec {
    /// Cluster name, also the name of the network, SSH key and load balancer
    pub cluster_name: String,
    /// Local path the admin kubeconfig is written to
    pub kube_config_path: PathBuf,
    /// Provider API token
    pub hetzner_token: String,
    /// Versions and users of the server image
    pub server_components: ServerComponents,
    /// Private network range (CIDR)
    pub ip_range: String,
    /// Server subnet within `ip_range` (defaults to `ip_range`)
    pub ip_range_subnet: String,
    /// Private key used for every SSH session
    pub ssh_private_key: PathBuf,
    /// Public key uploaded as the cluster SSH key
    pub ssh_public_key: PathBuf,
    /// Number of control-plane servers
    pub master_count: u32,
    /// Provider network zone for the subnet
    pub network_zone: String,
    /// Location for the load balancer
    pub location: String,
    /// Datacenter for servers
    pub datacenter: String,
    /// The provider account holds nothing but this cluster
    ///
    /// Deletion sweeps every volume in the account only when this is set.
    /// Clearing it protects volumes only: autoscaler workers and CCM load
    /// balancers are matched by account-wide labels and are deleted either way.
    pub dedicated_account: bool,
    /// Control-plane server settings
    pub master_servers: MasterServers,
    /// Control-plane load balancer settings
    pub master_load_balancer: MasterLoadBalancer,
    /// Free-form values for the cluster chart
    pub deployments: serde_yaml::Value,
    /// Script run on servers before bootstrap
    pub pre_start_script: String,
    /// Script run on servers after bootstrap
    pub post_start_script: String,
    /// Helm dependency values (`cluster-autoscaler`, `hcloud-csi`, ...)
    #[serde(flatten)]
    pub chart_values: BTreeMap<String, serde_yaml::Value>,
}

/// Control-plane server settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterServers {
    /// Name pattern, `%d` is replaced by the 1-based index
    pub name_pattern: String,
    /// Anti-affinity placement group name
    pub placement_group_name: String,
    /// Provider server type
    pub server_type: String,
    /// Image override; the ubuntu version is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Labels put on every master
    pub labels: BTreeMap<String, String>,
    /// Delay between bounded retry attempts
    #[serde(with = "duration_str")]
    pub wait_time_in_retry: Duration,
    /// Retries after the first attempt
    pub retry_time_limit: u32,
    /// Where the bootstrap script bundle comes from
    pub servers_init_params: ServersInitParams,
}

/// Location of the bootstrap script bundle
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServersInitParams {
    /// Tarball URL
    pub tar_gz: String,
    /// Top-level folder inside the tarball that holds `scripts/`
    pub folder: String,
}

impl ServersInitParams {
    /// Bundle for a branch of the upstream repository
    pub fn for_branch(branch: &str) -> Self {
        Self {
            tar_gz: format!(
                "https://github.com/maksim-paskal/hcloud-k8s-ctl/archive/refs/heads/{}.tar.gz",
                branch
            ),
            folder: format!("hcloud-k8s-ctl-{}", branch),
        }
    }
}

impl Default for ServersInitParams {
    fn default() -> Self {
        Self::for_branch("main")
    }
}

/// Control-plane load balancer settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterLoadBalancer {
    /// Provider load balancer type
    pub load_balancer_type: String,
    /// Public port
    pub listen_port: u16,
    /// Port on the masters
    pub destination_port: u16,
}

impl Default for MasterLoadBalancer {
    fn default() -> Self {
        Self {
            load_balancer_type: "lb11".to_string(),
            listen_port: DEFAULT_API_PORT,
            destination_port: DEFAULT_API_PORT,
        }
    }
}

/// Software installed on servers
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerComponents {
    /// Base image and users
    pub ubuntu: UbuntuComponent,
    /// Kubernetes version
    pub kubernetes: VersionComponent,
    /// Docker version
    pub docker: VersionComponent,
    /// Containerd version and pause image
    pub containerd: ContainerdComponent,
}

/// Base image settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct UbuntuComponent {
    /// Provider image name
    pub version: String,
    /// Administrative account prepared by the bootstrap scripts
    pub user_name: String,
    /// Account the fresh image accepts before bootstrap
    pub bootstrap_user: String,
    /// CPU architecture (`x86` or `arm`)
    pub architecture: String,
}

impl Default for UbuntuComponent {
    fn default() -> Self {
        Self {
            version: "ubuntu-20.04".to_string(),
            user_name: "hcloud-user".to_string(),
            bootstrap_user: "root".to_string(),
            architecture: "x86".to_string(),
        }
    }
}

/// A component pinned to a version
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VersionComponent {
    /// Version string passed to the bootstrap scripts
    pub version: String,
}

/// Containerd settings
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerdComponent {
    /// Package version
    pub version: String,
    /// Sandbox image
    pub pause_container: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AutoscalingGroup {
    name: String,
    min_size: u32,
    max_size: u32,
}

fn default_cluster_autoscaler() -> serde_yaml::Value {
    let groups: Vec<AutoscalingGroup> = DEFAULT_LOCATIONS
        .iter()
        .flat_map(|location| {
            DEFAULT_AUTOSCALER_INSTANCES
                .iter()
                .map(move |server| AutoscalingGroup {
                    name: format!(
                        "{}:{}:{}-{}",
                        server.to_uppercase(),
                        location.to_uppercase(),
                        server,
                        location
                    ),
                    min_size: 0,
                    max_size: DEFAULT_WORKERS_MAX,
                })
        })
        .collect();

    let mut values = serde_yaml::Mapping::new();
    values.insert(
        serde_yaml::Value::from("autoscalingGroups"),
        serde_yaml::to_value(groups).unwrap_or(serde_yaml::Value::Null),
    );
    serde_yaml::Value::Mapping(values)
}

impl Default for MasterServers {
    fn default() -> Self {
        Self {
            name_pattern: "master-%d".to_string(),
            placement_group_name: "master-placement-group".to_string(),
            server_type: "cx21".to_string(),
            image: None,
            labels: BTreeMap::from([("role".to_string(), "master".to_string())]),
            wait_time_in_retry: DEFAULT_WAIT,
            retry_time_limit: DEFAULT_RETRY_LIMIT,
            servers_init_params: ServersInitParams::default(),
        }
    }
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            cluster_name: "k8s".to_string(),
            kube_config_path: PathBuf::from("~/.kube/hcloud"),
            hetzner_token: String::new(),
            server_components: ServerComponents {
                ubuntu: UbuntuComponent::default(),
                kubernetes: VersionComponent {
                    version: "1.28.2".to_string(),
                },
                docker: VersionComponent {
                    version: "5:24.0.6-1~ubuntu.20.04~focal".to_string(),
                },
                containerd: ContainerdComponent {
                    version: "1.6.24-1".to_string(),
                    pause_container: "registry.k8s.io/pause:3.2".to_string(),
                },
            },
            ip_range: "10.0.0.0/16".to_string(),
            ip_range_subnet: String::new(),
            ssh_private_key: PathBuf::from("~/.ssh/id_rsa"),
            ssh_public_key: PathBuf::from("~/.ssh/id_rsa.pub"),
            master_count: DEFAULT_MASTER_COUNT,
            network_zone: "eu-central".to_string(),
            location: "fsn1".to_string(),
            datacenter: "fsn1-dc14".to_string(),
            dedicated_account: true,
            master_servers: MasterServers::default(),
            master_load_balancer: MasterLoadBalancer::default(),
            deployments: serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
            pre_start_script: String::new(),
            post_start_script: String::new(),
            chart_values: BTreeMap::from([(
                CLUSTER_AUTOSCALER_KEY.to_string(),
                default_cluster_autoscaler(),
            )]),
        }
    }
}

impl ClusterSpec {
    /// Parse a config document and fill in derived defaults.
    ///
    /// Token resolution and path expansion are done by [`ClusterSpec::resolve`].
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut spec: ClusterSpec = serde_yaml::from_str(content)
            .map_err(|e| Error::validation(format!("failed to parse config: {}", e)))?;

        if spec.ip_range_subnet.is_empty() {
            spec.ip_range_subnet = spec.ip_range.clone();
        }

        spec.chart_values
            .entry(CLUSTER_AUTOSCALER_KEY.to_string())
            .or_insert_with(default_cluster_autoscaler);

        Ok(spec)
    }

    /// Read, parse and resolve a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let mut spec = Self::from_yaml_str(&content)?;
        spec.resolve()?;
        Ok(spec)
    }

    /// Resolve the token from the environment and expand `~` in local paths
    pub fn resolve(&mut self) -> Result<()> {
        if self.hetzner_token.is_empty() {
            if let Ok(token) = std::env::var(TOKEN_ENV) {
                self.hetzner_token = token;
            }
        }

        if self.hetzner_token.is_empty() {
            match std::fs::read_to_string(TOKEN_FILE) {
                Ok(token) => self.hetzner_token = token.trim().to_string(),
                Err(e) => debug!(error = %e, "No {} file", TOKEN_FILE),
            }
        }

        self.kube_config_path = expand_home(&self.kube_config_path)?;
        self.ssh_private_key = expand_home(&self.ssh_private_key)?;
        self.ssh_public_key = expand_home(&self.ssh_public_key)?;

        Ok(())
    }

    /// Validate everything that can be checked without the provider.
    pub fn validate(&self) -> Result<()> {
        if self.hetzner_token.is_empty() {
            return Err(Error::validation(format!(
                "no provider token: set hetznerToken, {} or {}",
                TOKEN_ENV, TOKEN_FILE
            )));
        }

        if self.cluster_name.is_empty() {
            return Err(Error::validation("clusterName must not be empty"));
        }

        if self.master_count < 1 {
            return Err(Error::validation("masterCount must be at least 1"));
        }

        if !self.master_servers.name_pattern.contains("%d") {
            return Err(Error::validation(format!(
                "masterServers.namePattern '{}' must contain %d",
                self.master_servers.name_pattern
            )));
        }

        let range = Ipv4Cidr::parse(&self.ip_range)
            .map_err(|e| Error::validation(format!("failed to parse ipRange: {}", e)))?;
        let subnet = Ipv4Cidr::parse(&self.ip_range_subnet)
            .map_err(|e| Error::validation(format!("failed to parse ipRangeSubnet: {}", e)))?;

        if !range.contains(&subnet) {
            return Err(Error::validation(format!(
                "ipRangeSubnet {} is not within ipRange {}",
                self.ip_range_subnet, self.ip_range
            )));
        }

        Ok(())
    }

    /// Check that the SSH key files exist
    pub fn validate_key_files(&self) -> Result<()> {
        for (name, path) in [
            ("sshPrivateKey", &self.ssh_private_key),
            ("sshPublicKey", &self.ssh_public_key),
        ] {
            if !path.is_file() {
                return Err(Error::validation(format!(
                    "{} {} does not exist",
                    name,
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Name of the master with the given 1-based index
    pub fn master_name(&self, index: u32) -> String {
        self.master_servers
            .name_pattern
            .replace("%d", &index.to_string())
    }

    /// Name of the master that runs control-plane init
    pub fn first_master_name(&self) -> String {
        self.master_name(1)
    }

    /// Role of the master with the given 1-based index
    pub fn master_role(&self, index: u32) -> ServerRole {
        if index == 1 {
            ServerRole::FirstMaster
        } else {
            ServerRole::AdditionalMaster
        }
    }

    /// Role of a listed server, judged by its labels and name
    pub fn role_of(&self, server_name: &str, labels: &BTreeMap<String, String>) -> ServerRole {
        if !self.master_selector().matches(labels) {
            ServerRole::Worker
        } else if server_name == self.first_master_name() {
            ServerRole::FirstMaster
        } else {
            ServerRole::AdditionalMaster
        }
    }

    /// Image servers are created from
    pub fn server_image(&self) -> &str {
        self.master_servers
            .image
            .as_deref()
            .unwrap_or(&self.server_components.ubuntu.version)
    }

    /// Bounded retry budget for provisioning
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.master_servers.retry_time_limit,
            self.master_servers.wait_time_in_retry,
        )
    }

    /// Labels for every resource the cluster owns
    pub fn cluster_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(CLUSTER_LABEL.to_string(), self.cluster_name.clone())])
    }

    /// Labels for master servers: the configured labels plus the cluster label
    pub fn master_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.master_servers.labels.clone();
        labels.extend(self.cluster_labels());
        labels
    }

    /// Selector matching this cluster's masters
    pub fn master_selector(&self) -> LabelSelector {
        LabelSelector::from_labels(&self.master_labels())
    }

    /// Selector matching autoscaler-created workers
    pub fn node_group_selector(&self) -> LabelSelector {
        LabelSelector::node_group()
    }

    /// Selector matching resources labelled with the cluster name
    pub fn cluster_selector(&self) -> LabelSelector {
        LabelSelector::cluster(&self.cluster_name)
    }

    /// Full config serialized as YAML and base64-encoded for the post-install script
    pub fn deployment_values(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))?;
        Ok(STANDARD.encode(yaml))
    }

    /// YAML with the token masked, for display
    pub fn to_display_yaml(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))?;
        if self.hetzner_token.is_empty() {
            return Ok(yaml);
        }
        Ok(yaml.replace(&self.hetzner_token, SECRET_PLACEHOLDER))
    }

    /// YAML without keys that only make sense on this machine or are secret
    pub fn to_shareable_yaml(&self) -> Result<String> {
        let mut value =
            serde_yaml::to_value(self).map_err(|e| Error::serialization(e.to_string()))?;
        if let Some(mapping) = value.as_mapping_mut() {
            for key in LOCAL_ONLY_KEYS {
                mapping.remove(key);
            }
        }
        serde_yaml::to_string(&value).map_err(|e| Error::serialization(e.to_string()))
    }
}

fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| Error::validation("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

/// IPv4 network in CIDR notation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Parse `a.b.c.d/n`
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("'{}' is not in CIDR notation", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| format!("'{}' has an invalid address", s))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| format!("'{}' has an invalid prefix length", s))?;

        Ok(Self {
            network: u32::from(addr) & Self::mask(prefix),
            prefix,
        })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    /// True if `other` lies entirely within this network
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix
            && (other.network & Self::mask(self.prefix)) == self.network
    }
}

/// Durations written as `3s`, `500ms`, `2m`, `1h` or bare seconds
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        if d.subsec_millis() != 0 {
            s.serialize_str(&format!("{}ms", d.as_millis()))
        } else {
            s.serialize_str(&format!("{}s", d.as_secs()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

/// Parse a human-friendly duration (`500ms`, `3s`, `2m`, `1h`, `10`)
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let invalid = || format!("invalid duration '{}', expected e.g. 500ms, 3s, 2m, 1h", s);

    let (number, unit_millis) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s, 1_000)
    };

    let n: u64 = number.trim().parse().map_err(|_| invalid())?;
    let millis = n.checked_mul(unit_millis).ok_or_else(invalid)?;
    Ok(Duration::from_millis(millis))
}

//! Label selectors used to identify cluster-owned resources
//!
//! Resources are found by free-text provider label selectors. Building them in
//! one place keeps the delete path and the create path in agreement about which
//! labels identify which resources.

use std::collections::BTreeMap;
use std::fmt;

/// Label every created resource carries, valued with the cluster name
pub const CLUSTER_LABEL: &str = "cluster";

/// Label set by the cluster autoscaler on worker servers it creates
pub const NODE_GROUP_LABEL: &str = "hcloud/node-group";

/// Label set by the cloud controller manager on load balancers it creates
pub const CCM_SERVICE_LABEL: &str = "hcloud-ccm/service-uid";

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    Exists(String),
}

/// A provider label selector (`key=value,other`)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Empty selector
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector requiring every label in the map, in key order
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        labels
            .iter()
            .fold(Self::new(), |selector, (k, v)| selector.with_equals(k, v))
    }

    /// Require `key=value`
    pub fn with_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(Requirement::Equals(key.into(), value.into()));
        self
    }

    /// Require that `key` is present with any value
    pub fn with_exists(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::Exists(key.into()));
        self
    }

    /// True if the selector has no requirements (matches everything)
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Selector for resources labelled with the cluster name
    pub fn cluster(cluster_name: &str) -> Self {
        Self::new().with_equals(CLUSTER_LABEL, cluster_name)
    }

    /// Selector for autoscaler-created worker servers
    pub fn node_group() -> Self {
        Self::new().with_exists(NODE_GROUP_LABEL)
    }

    /// Selector for load balancers created by the cloud controller manager
    pub fn ccm_load_balancers() -> Self {
        Self::new().with_exists(CCM_SERVICE_LABEL)
    }

    /// Check a label map against the selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| match r {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match r {
                Requirement::Equals(k, v) => format!("{}={}", k, v),
                Requirement::Exists(k) => k.clone(),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

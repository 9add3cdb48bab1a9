//! Firewall rule sets for control-plane and worker servers
//!
//! Rules are generated from the cluster IP range so the overlay network and
//! kubelet ports are reachable only from inside the cluster, while SSH and
//! the API server stay reachable from anywhere.

use crate::config::ClusterSpec;
use crate::provider::{Direction, FirewallCreate, FirewallRule, Protocol};

const ANY_IPV4: &str = "0.0.0.0/0";
const ANY_IPV6: &str = "::/0";

/// Which set of servers a firewall protects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirewallRole {
    /// Master servers
    ControlPlane,
    /// Autoscaler workers
    Workers,
}

impl FirewallRole {
    fn suffix(self) -> &'static str {
        match self {
            FirewallRole::ControlPlane => "controlplane",
            FirewallRole::Workers => "workers",
        }
    }
}

fn rule(protocol: Protocol, port: &str, sources: &[&str], description: &str) -> FirewallRule {
    FirewallRule {
        direction: Direction::In,
        protocol,
        port: port.to_string(),
        source_ips: sources.iter().map(|s| s.to_string()).collect(),
        description: description.to_string(),
    }
}

fn shared_rules(ip_range: &str) -> Vec<FirewallRule> {
    vec![
        rule(Protocol::Tcp, "22", &[ANY_IPV4, ANY_IPV6], "ssh"),
        rule(Protocol::Udp, "8285", &[ip_range], "flannel udp backend"),
        rule(Protocol::Udp, "8472", &[ip_range], "flannel vxlan backend"),
    ]
}

/// Inbound rules for a role
pub fn rules_for(role: FirewallRole, ip_range: &str) -> Vec<FirewallRule> {
    let mut rules = shared_rules(ip_range);

    match role {
        FirewallRole::ControlPlane => rules.extend([
            rule(Protocol::Tcp, "6443", &[ANY_IPV4, ANY_IPV6], "kubernetes api server"),
            rule(Protocol::Tcp, "2379-2380", &[ANY_IPV4, ANY_IPV6], "etcd server client api"),
            rule(Protocol::Tcp, "10250", &[ip_range], "kubelet api"),
            rule(Protocol::Tcp, "10259", &[ip_range], "kube-scheduler"),
            rule(Protocol::Tcp, "10257", &[ip_range], "kube-controller-manager"),
        ]),
        FirewallRole::Workers => rules.extend([
            rule(Protocol::Tcp, "10250", &[ip_range], "kubelet api"),
            rule(Protocol::Tcp, "30000-32767", &[ip_range], "nodeport services"),
        ]),
    }

    rules
}

/// Full firewall request for a role of the given cluster
pub fn firewall_request(spec: &ClusterSpec, role: FirewallRole) -> FirewallCreate {
    let apply_to = match role {
        FirewallRole::ControlPlane => spec.master_selector(),
        FirewallRole::Workers => spec.node_group_selector(),
    };

    FirewallCreate {
        name: format!("{}-{}", spec.cluster_name, role.suffix()),
        labels: spec.cluster_labels(),
        rules: rules_for(role, &spec.ip_range),
        apply_to,
    }
}

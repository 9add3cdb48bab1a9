//! Remote commands run on cluster servers
//!
//! The bootstrap bundle is a tarball unpacked into `/root/scripts`. The
//! orchestrator only knows the fixed script paths below; what the scripts do
//! is up to the bundle.

use crate::config::ServersInitParams;

/// Trivial command used as a reachability probe
pub const PROBE: &str = "date";

/// Prints the join script generated by control-plane init
pub const READ_JOIN_SCRIPT: &str = "cat /root/scripts/join-master.sh";

/// Prints the admin kubeconfig of the first master
pub const READ_KUBECONFIG: &str = "cat /etc/kubernetes/admin.conf";

/// Relaxes control-plane settings for a single master
pub const ONE_MASTER_MODE: &str = "/root/scripts/one-master-mode.sh";

const COMMON_INSTALL: &str = "/root/scripts/common-install.sh";
const INIT_MASTER: &str = "/root/scripts/init-master.sh";
const POST_INSTALL: &str = "/root/scripts/post-install.sh";

/// Replace `/root` contents with a fresh copy of the bootstrap bundle
pub fn fetch_scripts(params: &ServersInitParams) -> String {
    format!(
        r#"#!/bin/bash
set -ex

export DEBIAN_FRONTEND=noninteractive

cd /root
rm -rf *
curl -sSL -o scripts.tar.gz {tar_gz}

tar -xvf scripts.tar.gz
mv ./{folder}/scripts ./scripts
"#,
        tar_gz = params.tar_gz,
        folder = params.folder,
    )
}

/// User data for masters 2..N: fetch the bundle and pre-stage tooling
pub fn common_install(params: &ServersInitParams) -> String {
    format!("{}\n{}\n", fetch_scripts(params), COMMON_INSTALL)
}

/// Control-plane init on the first master
pub fn init_master(params: &ServersInitParams, token: &str, load_balancer_ip: &str) -> String {
    format!(
        "{}\nexport HCLOUD_TOKEN={}\nexport MASTER_LB={}\n\n{}\n",
        fetch_scripts(params),
        token,
        load_balancer_ip,
        INIT_MASTER
    )
}

/// Apply the cluster workloads with base64-encoded deployment values
pub fn post_install(values: &str) -> String {
    format!("VALUES={} {}", values, POST_INSTALL)
}

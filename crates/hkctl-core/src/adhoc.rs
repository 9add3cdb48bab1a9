//! Ad-hoc command fan-out across the fleet
//!
//! One task per target server, no concurrency cap. Results land in a shared
//! status map; a failing node never cancels its siblings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::ClusterSpec;
use crate::provider::{list_all_servers, CloudProvider, Server};
use crate::remote::RemoteExecutor;
use crate::{scripts, Error, Result};

/// Outcome per server name: `"ok"` or an error message
pub type AdhocStatus = BTreeMap<String, String>;

/// Status recorded for a node whose command succeeded
pub const STATUS_OK: &str = "ok";

/// What to run and where
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdhocRequest {
    /// Principal; empty means the admin user
    pub user: String,
    /// Command to run
    pub command: String,
    /// Target masters
    pub include_masters: bool,
    /// Target autoscaler workers
    pub include_workers: bool,
    /// Re-fetch the script bundle before running the command
    pub refresh_scripts: bool,
}

/// Runs one command on many servers concurrently
pub struct FleetCommandExecutor {
    spec: Arc<ClusterSpec>,
    provider: Arc<dyn CloudProvider>,
    executor: Arc<dyn RemoteExecutor>,
}

impl FleetCommandExecutor {
    /// Create a fleet executor
    pub fn new(
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

    async fn targets(&self, request: &AdhocRequest) -> Result<Vec<Server>> {
        let mut servers = Vec::new();

        if request.include_masters {
            servers.extend(list_all_servers(self.provider.as_ref(), &self.spec.master_selector()).await?);
        }
        if request.include_workers {
            servers.extend(
                list_all_servers(self.provider.as_ref(), &self.spec.node_group_selector()).await?,
            );
        }

        let mut seen = BTreeSet::new();
        servers.retain(|s| seen.insert(s.id));
        Ok(servers)
    }

    /// Run the command on every selected server and wait for all of them
    pub async fn run_adhoc(&self, request: &AdhocRequest) -> Result<AdhocStatus> {
        let servers = self.targets(request).await?;
        if servers.is_empty() {
            error!(
                masters = request.include_masters,
                workers = request.include_workers,
                "No servers found"
            );
            return Ok(AdhocStatus::new());
        }

        let user = if request.user.is_empty() {
            self.spec.server_components.ubuntu.user_name.clone()
        } else {
            request.user.clone()
        };
        let fetch = request
            .refresh_scripts
            .then(|| scripts::fetch_scripts(&self.spec.master_servers.servers_init_params));

        info!(servers = servers.len(), user = %user, "Running ad-hoc command");

        let status = Arc::new(Mutex::new(AdhocStatus::new()));
        let mut tasks = JoinSet::new();

        for server in servers {
            let role = self.spec.role_of(&server.name, &server.labels);
            let executor = self.executor.clone();
            let status = status.clone();
            let user = user.clone();
            let command = request.command.clone();
            let fetch = fetch.clone();

            tasks.spawn(async move {
                let outcome = match server.public_ipv4.as_deref() {
                    None => "server has no public address".to_string(),
                    Some(ip) => {
                        let mut result = Ok(());
                        if let Some(fetch) = &fetch {
                            result = executor.execute(ip, &user, fetch).await.map(|_| ());
                        }
                        if result.is_ok() {
                            result = executor.execute(ip, &user, &command).await.map(|output| {
                                info!(
                                    server = %server.name,
                                    role = ?role,
                                    stdout = %output.stdout.trim_end(),
                                    "Command finished"
                                );
                            });
                        }
                        match result {
                            Ok(()) => STATUS_OK.to_string(),
                            Err(e) => describe(&e),
                        }
                    }
                };
                status.lock().insert(server.name, outcome);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Ad-hoc task panicked");
            }
        }

        let status = std::mem::take(&mut *status.lock());
        for (server, outcome) in &status {
            if outcome == STATUS_OK {
                info!(server = %server, "ok");
            } else {
                warn!(server = %server, error = %outcome, "failed");
            }
        }

        Ok(status)
    }
}

/// Error message plus whatever the command wrote to stderr
fn describe(error: &Error) -> String {
    match error.remote_stderr().trim() {
        "" => error.to_string(),
        stderr => format!("{}: {}", error, stderr),
    }
}

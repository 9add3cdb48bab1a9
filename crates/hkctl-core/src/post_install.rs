//! Cluster workload deployment on the first master
//!
//! Runs after control-plane init during `create` and on its own for
//! `patch-cluster`. The whole attempt (reachability, optional script refresh,
//! post-install, single-master adjustment) is retried as one unit, so a
//! half-applied attempt is simply run again.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ClusterSpec;
use crate::readiness::ReadinessPoller;
use crate::remote::RemoteExecutor;
use crate::retry::retry_bounded;
use crate::{scripts, Result};

/// Applies the cluster workloads on the first master
pub struct PostInstallRunner {
    spec: Arc<ClusterSpec>,
    executor: Arc<dyn RemoteExecutor>,
    poller: Arc<ReadinessPoller>,
}

impl PostInstallRunner {
    /// Create a runner
    pub fn new(
        spec: Arc<ClusterSpec>,
        executor: Arc<dyn RemoteExecutor>,
        poller: Arc<ReadinessPoller>,
    ) -> Self {
        Self {
            spec,
            executor,
            poller,
        }
    }

    /// Run post-install as `user`, re-fetching the script bundle first when
    /// `copy_new_scripts` is set
    pub async fn run(
        &self,
        user: &str,
        copy_new_scripts: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(copy_new_scripts = copy_new_scripts, "Executing post-install");

        let spec = self.spec.as_ref();
        let server = spec.first_master_name();
        let server = server.as_str();
        let values = spec.deployment_values()?;
        let post_install = scripts::post_install(&values);
        let post_install = post_install.as_str();

        retry_bounded(self.poller.policy(), cancel, "post install", |attempt| async move {
            debug!(server = %server, attempt = attempt, "Waiting for first master");
            let ip = self.poller.probe_server(server, user).await?;

            if copy_new_scripts {
                info!(server = %server, "Loading new scripts");
                let fetch = scripts::fetch_scripts(&spec.master_servers.servers_init_params);
                self.executor.execute(&ip, user, &fetch).await?;
            }

            self.executor.execute(&ip, user, post_install).await?;

            if spec.master_count == 1 {
                info!(server = %server, "Single master, relaxing control-plane settings");
                self.executor
                    .execute(&ip, user, scripts::ONE_MASTER_MODE)
                    .await?;
            }

            Ok(())
        })
        .await?;

        info!("Post-install finished");
        Ok(())
    }
}

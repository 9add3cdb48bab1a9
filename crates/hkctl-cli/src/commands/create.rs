//! Create command - provision a new cluster

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{connect, Needs};
use crate::Result;

pub async fn run(config: &Path, cancel: &CancellationToken) -> Result<()> {
    let api = connect(config, Needs::Shell).await?;
    let state = api.create(cancel).await?;

    info!(
        kubeconfig = %api.spec().kube_config_path.display(),
        ssh_user = %state.ssh_user,
        "Cluster is ready"
    );
    Ok(())
}

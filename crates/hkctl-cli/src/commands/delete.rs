//! Delete command - remove every cluster resource
//!
//! Runs until the account holds nothing of the cluster, or until interrupted.

use std::path::Path;

use hkctl_core::drain::DrainOutcome;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{connect, Needs};
use crate::{Error, Result};

pub async fn run(config: &Path, cancel: &CancellationToken) -> Result<()> {
    let api = connect(config, Needs::Provider).await?;

    match api.delete(cancel).await {
        DrainOutcome::Converged => {
            info!(cluster = %api.spec().cluster_name, "Cluster deleted");
            Ok(())
        }
        DrainOutcome::Cancelled => Err(Error::Interrupted {
            operation: "delete",
        }),
    }
}

//! CLI commands

use std::path::Path;
use std::sync::Arc;

use hkctl_core::{ClusterApi, ClusterSpec};
use tracing::{debug, info};

use crate::Result;

pub mod adhoc;
pub mod create;
pub mod create_firewall;
pub mod delete;
pub mod list_configurations;
pub mod patch;
pub mod save_full_config;

/// What a command needs checked before it runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Needs {
    /// Provider token only
    Provider,
    /// Provider token and the SSH key pair
    Shell,
}

/// Load, resolve and validate the config file
pub fn load_spec(path: &Path, needs: Needs) -> Result<Arc<ClusterSpec>> {
    info!(config = %path.display(), "Loading config");
    let spec = ClusterSpec::load(path)?;
    spec.validate()?;
    if needs == Needs::Shell {
        spec.validate_key_files()?;
    }
    debug!(config = %spec.to_display_yaml()?, "Loaded config");
    Ok(Arc::new(spec))
}

/// Build the API and check the config against the provider account
pub async fn connect(path: &Path, needs: Needs) -> Result<ClusterApi> {
    let api = ClusterApi::new(load_spec(path, needs)?)?;
    api.validate().await?;
    Ok(api)
}

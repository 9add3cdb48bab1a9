//! Create firewall command

use std::path::Path;

use clap::Args;
use tracing::info;

use super::{connect, Needs};
use crate::{Error, Result};

/// Create firewalls for an existing cluster
#[derive(Args, Debug)]
pub struct CreateFirewallArgs {
    /// Create the control-plane firewall
    #[arg(long = "controlplane")]
    pub control_plane: bool,

    /// Create the workers firewall
    #[arg(long)]
    pub workers: bool,
}

pub async fn run(args: CreateFirewallArgs, config: &Path) -> Result<()> {
    if !args.control_plane && !args.workers {
        return Err(Error::command_failed(
            "select at least one of --controlplane or --workers",
        ));
    }

    let api = connect(config, Needs::Provider).await?;
    for firewall in api.create_firewalls(args.control_plane, args.workers).await? {
        info!(firewall = %firewall.name, id = firewall.id, "Firewall created");
    }
    Ok(())
}

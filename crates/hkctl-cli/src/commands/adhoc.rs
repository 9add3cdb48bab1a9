//! Adhoc command - run one command on many servers

use std::path::Path;

use clap::{ArgAction, Args};
use hkctl_core::adhoc::{AdhocRequest, STATUS_OK};
use tracing::info;

use super::{connect, Needs};
use crate::{Error, Result};

/// Run a command on cluster servers
#[derive(Args, Debug)]
pub struct AdhocArgs {
    /// Command to run
    #[arg(long)]
    pub command: String,

    /// SSH user (defaults to the admin user from the config)
    #[arg(long, default_value = "")]
    pub user: String,

    /// Also run on masters
    #[arg(long)]
    pub masters: bool,

    /// Run on autoscaler workers
    #[arg(
        long,
        action = ArgAction::Set,
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub workers: bool,

    /// Fetch the latest scripts before running the command
    #[arg(long)]
    pub copy_new_scripts: bool,
}

impl From<AdhocArgs> for AdhocRequest {
    fn from(args: AdhocArgs) -> Self {
        AdhocRequest {
            user: args.user,
            command: args.command,
            include_masters: args.masters,
            include_workers: args.workers,
            refresh_scripts: args.copy_new_scripts,
        }
    }
}

pub async fn run(args: AdhocArgs, config: &Path) -> Result<()> {
    if args.command.trim().is_empty() {
        return Err(Error::command_failed("--command must not be empty"));
    }

    let api = connect(config, Needs::Shell).await?;
    let status = api.adhoc(&args.into()).await?;

    let failed = status.values().filter(|s| s.as_str() != STATUS_OK).count();
    info!(servers = status.len(), failed = failed, "Ad-hoc finished");

    if failed > 0 {
        return Err(Error::command_failed(format!(
            "{} of {} servers failed",
            failed,
            status.len()
        )));
    }
    Ok(())
}

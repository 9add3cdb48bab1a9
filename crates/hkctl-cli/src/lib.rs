//! hcloud-k8s-ctl CLI library

pub mod commands;
pub mod error;
pub mod shutdown;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// hcloud-k8s-ctl - Kubernetes clusters on Hetzner Cloud
#[derive(Parser, Debug)]
#[command(name = "hcloud-k8s-ctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the cluster config file
    #[arg(long, env = "CONFIG", default_value = "config.yaml", global = true)]
    pub config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision a new cluster
    Create,
    /// Delete every resource of the cluster
    Delete,
    /// Re-run post-install with fresh scripts
    PatchCluster,
    /// Run a command on cluster servers
    Adhoc(commands::adhoc::AdhocArgs),
    /// Print locations, datacenters and server types
    ListConfigurations,
    /// Create firewalls for an existing cluster
    CreateFirewall(commands::create_firewall::CreateFirewallArgs),
    /// Write the resolved config without local-only keys
    SaveFullConfig(commands::save_full_config::SaveFullConfigArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        shutdown::install(cancel.clone());

        match self.command {
            Commands::Create => commands::create::run(&self.config, &cancel).await,
            Commands::Delete => commands::delete::run(&self.config, &cancel).await,
            Commands::PatchCluster => commands::patch::run(&self.config, &cancel).await,
            Commands::Adhoc(args) => commands::adhoc::run(args, &self.config).await,
            Commands::ListConfigurations => {
                commands::list_configurations::run(&self.config).await
            }
            Commands::CreateFirewall(args) => {
                commands::create_firewall::run(args, &self.config).await
            }
            Commands::SaveFullConfig(args) => {
                commands::save_full_config::run(args, &self.config).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_config_yaml() {
        let cli = Cli::try_parse_from(["hcloud-k8s-ctl", "create"]).unwrap();
        assert!(matches!(cli.command, Commands::Create));
        assert_eq!(cli.log_level, "info");
        if std::env::var_os("CONFIG").is_none() {
            assert_eq!(cli.config, PathBuf::from("config.yaml"));
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "hcloud-k8s-ctl",
            "delete",
            "--config",
            "cluster.yaml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Delete));
        assert_eq!(cli.config, PathBuf::from("cluster.yaml"));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn kebab_case_actions() {
        for argv in [
            vec!["hcloud-k8s-ctl", "patch-cluster"],
            vec!["hcloud-k8s-ctl", "list-configurations"],
            vec!["hcloud-k8s-ctl", "create-firewall", "--controlplane"],
            vec!["hcloud-k8s-ctl", "save-full-config", "--path", "full.yaml"],
        ] {
            assert!(Cli::try_parse_from(&argv).is_ok(), "{argv:?} should parse");
        }
    }

    #[test]
    fn save_full_config_requires_path() {
        assert!(Cli::try_parse_from(["hcloud-k8s-ctl", "save-full-config"]).is_err());
    }

    #[test]
    fn create_firewall_flags() {
        let cli = Cli::try_parse_from(["hcloud-k8s-ctl", "create-firewall", "--workers"]).unwrap();
        let Commands::CreateFirewall(args) = cli.command else {
            panic!("expected create-firewall");
        };
        assert!(!args.control_plane);
        assert!(args.workers);
    }

    #[test]
    fn adhoc_requires_command() {
        assert!(Cli::try_parse_from(["hcloud-k8s-ctl", "adhoc"]).is_err());

        let cli = Cli::try_parse_from([
            "hcloud-k8s-ctl",
            "adhoc",
            "--command",
            "uptime",
            "--masters",
        ])
        .unwrap();
        let Commands::Adhoc(args) = cli.command else {
            panic!("expected adhoc");
        };
        assert_eq!(args.command, "uptime");
        assert!(args.masters);
        assert!(args.workers);
        assert!(!args.copy_new_scripts);
        assert!(args.user.is_empty());
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(Cli::try_parse_from(["hcloud-k8s-ctl", "upgrade-controlplane"]).is_err());
    }
}

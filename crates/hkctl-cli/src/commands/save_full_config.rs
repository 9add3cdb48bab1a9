//! Save full config command
//!
//! Writes the resolved config, defaults included, so it can be shared. Keys
//! that are secret or only meaningful on this machine are left out.

use std::path::{Path, PathBuf};

use clap::Args;
use hkctl_core::ClusterSpec;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::{Error, Result};

/// Save the resolved config
#[derive(Args, Debug)]
pub struct SaveFullConfigArgs {
    /// Where to write the config
    #[arg(long)]
    pub path: PathBuf,
}

pub async fn run(args: SaveFullConfigArgs, config: &Path) -> Result<()> {
    let spec = ClusterSpec::load(config)?;
    let yaml = spec.to_shareable_yaml()?;
    write_private(&args.path, &yaml).await?;
    info!(path = %args.path.display(), "Config saved");
    Ok(())
}

/// Write `contents` to `path` readable by the owner only
async fn write_private(path: &Path, contents: &str) -> Result<()> {
    let write_err = |source| Error::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await.map_err(write_err)?;
    file.write_all(contents.as_bytes()).await.map_err(write_err)?;
    file.flush().await.map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(write_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn omits_local_keys_and_restricts_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.yaml");
        std::fs::write(
            &config,
            "clusterName: demo\nhetznerToken: secret-token\nmasterCount: 1\n",
        )
        .unwrap();
        let out = dir.path().join("full.yaml");

        run(SaveFullConfigArgs { path: out.clone() }, &config)
            .await
            .unwrap();

        let saved = std::fs::read_to_string(&out).unwrap();
        assert!(saved.contains("clusterName: demo"));
        assert!(saved.contains("masterCount: 1"));
        for key in ["hetznerToken", "kubeConfigPath", "sshPrivateKey", "sshPublicKey"] {
            assert!(!saved.contains(key), "{key} should be omitted");
        }
        assert!(!saved.contains("secret-token"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&out).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn missing_directory_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_private(&dir.path().join("no/such/dir.yaml"), "a: 1\n")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Write { .. }));
    }
}

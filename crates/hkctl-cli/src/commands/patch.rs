//! Patch command - re-run post-install with freshly fetched scripts

use std::path::Path;

use tokio_util::sync::CancellationToken;

use super::{connect, Needs};
use crate::Result;

pub async fn run(config: &Path, cancel: &CancellationToken) -> Result<()> {
    let api = connect(config, Needs::Shell).await?;
    api.patch(cancel).await?;
    Ok(())
}

//! List configurations command

use std::path::Path;

use super::{connect, Needs};
use crate::Result;

pub async fn run(config: &Path) -> Result<()> {
    let api = connect(config, Needs::Provider).await?;
    let configurations = api.list_configurations().await?;
    print!("{}", serde_yaml::to_string(&configurations)?);
    Ok(())
}

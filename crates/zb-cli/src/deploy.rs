//! `deploy` command

use crate::settings::GlobalArgs;
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use tracing::{info, warn};
use zb_client::{Connection, Deployment, DEFAULT_TOPIC};

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Workflow definition file (deployed as-is)
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Topic to execute the command on
    #[arg(short = 't', long, env = "ZB_TOPIC_NAME", default_value = DEFAULT_TOPIC)]
    pub topic: String,
}

impl DeployArgs {
    pub async fn run(self, global: &GlobalArgs) -> Result<()> {
        let deployment = Deployment::from_file(self.file.unwrap_or_default())?;
        let config = global.load_config()?;

        let connection = Connection::open(&config).await?;
        let response = connection
            .deploy(&self.topic, deployment)
            .await?
            .into_result()?;

        match response.field("state") {
            Some(state) => info!("Deployment state: {}", state),
            None => warn!("Deployment response carries no state"),
        }
        crate::print_response(&response)?;
        connection.close().await;
        Ok(())
    }
}

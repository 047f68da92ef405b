//! `create-task` command

use crate::settings::GlobalArgs;
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use tracing::info;
use zb_client::{load_document, Connection, Task, DEFAULT_TOPIC};

#[derive(Args, Debug)]
pub struct CreateTaskArgs {
    /// YAML file describing the task
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Topic to execute the command on
    #[arg(short = 't', long, env = "ZB_TOPIC_NAME", default_value = DEFAULT_TOPIC)]
    pub topic: String,
}

impl CreateTaskArgs {
    pub async fn run(self, global: &GlobalArgs) -> Result<()> {
        let task: Task = load_document(self.file.unwrap_or_default())?;
        let config = global.load_config()?;

        let connection = Connection::open(&config).await?;
        let response = connection
            .create_task(&self.topic, &task)
            .await?
            .into_result()?;

        info!("Success. Received response with key {}", response.key);
        crate::print_response(&response)?;
        connection.close().await;
        Ok(())
    }
}

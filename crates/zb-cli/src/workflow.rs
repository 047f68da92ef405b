//! `create-workflow-instance` command

use crate::settings::GlobalArgs;
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use tracing::info;
use zb_client::{load_document, Connection, WorkflowInstance, DEFAULT_TOPIC};

#[derive(Args, Debug)]
pub struct CreateWorkflowInstanceArgs {
    /// YAML file describing the workflow instance
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Topic to execute the command on
    #[arg(short = 't', long, env = "ZB_TOPIC_NAME", default_value = DEFAULT_TOPIC)]
    pub topic: String,
}

impl CreateWorkflowInstanceArgs {
    pub async fn run(self, global: &GlobalArgs) -> Result<()> {
        let instance: WorkflowInstance = load_document(self.file.unwrap_or_default())?;
        let config = global.load_config()?;

        let connection = Connection::open(&config).await?;
        let response = connection
            .create_workflow_instance(&self.topic, &instance)
            .await?
            .into_result()?;

        info!(
            "Success. Created instance of '{}' with key {}",
            instance.bpmn_process_id, response.key
        );
        crate::print_response(&response)?;
        connection.close().await;
        Ok(())
    }
}

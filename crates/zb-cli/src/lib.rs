//! Workflow broker control client library

pub mod deploy;
pub mod settings;
pub mod subscribe;
pub mod task;
pub mod workflow;

use anyhow::Result;
use zb_client::{Response, ResponsePayload};

// Re-export CLI types for testing
pub use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "zbctl")]
#[command(about = "Workflow broker control client")]
#[command(version, author, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: settings::GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new task using the given YAML file
    #[command(name = "create-task", visible_alias = "t")]
    CreateTask(task::CreateTaskArgs),
    /// Create a new workflow instance using the given YAML file
    #[command(name = "create-workflow-instance", visible_alias = "wf")]
    CreateWorkflowInstance(workflow::CreateWorkflowInstanceArgs),
    /// Deploy a workflow definition
    #[command(visible_alias = "d")]
    Deploy(deploy::DeployArgs),
    /// Open a task subscription and print every delivered task
    #[command(visible_alias = "n")]
    Open(subscribe::OpenArgs),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::CreateTask(args) => args.run(&self.global).await,
            Commands::CreateWorkflowInstance(args) => args.run(&self.global).await,
            Commands::Deploy(args) => args.run(&self.global).await,
            Commands::Open(args) => args.run(&self.global).await,
        }
    }
}

/// Print a command response on stdout, one line.
pub(crate) fn print_response(response: &Response) -> Result<()> {
    match &response.payload {
        ResponsePayload::Document(document) => println!("{}", serde_json::to_string(document)?),
        ResponsePayload::Raw(bytes) => println!("{}", String::from_utf8_lossy(bytes)),
    }
    Ok(())
}

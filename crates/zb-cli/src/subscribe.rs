//! `open` command: consume a task subscription until interrupted

use crate::settings::GlobalArgs;
use anyhow::Result;
use clap::Args;
use futures::StreamExt;
use tracing::{debug, info, warn};
use zb_client::{CancellationToken, ClientConfig, ClientError, Connection, SubscriptionSpec};

#[derive(Args, Debug)]
pub struct OpenArgs {
    /// Topic to subscribe to
    #[arg(short = 't', long, env = "ZB_TOPIC_NAME")]
    pub topic: Option<String>,

    /// Partition to open the subscription on
    #[arg(
        short = 'p',
        long,
        env = "ZB_PARTITION_ID",
        allow_negative_numbers = true
    )]
    pub partition_id: Option<i32>,

    /// Lock owner reported to the broker
    #[arg(short = 'l', long, env = "ZB_LOCK_OWNER")]
    pub lock_owner: Option<String>,

    /// Type of the tasks to receive
    #[arg(long = "task-type", visible_alias = "tt", env = "ZB_TASK_TYPE")]
    pub task_type: Option<String>,

    /// Number of tasks the broker may push before it has to wait
    #[arg(long)]
    pub credits: Option<u32>,

    /// How long a delivered task stays locked to this client
    #[arg(long = "lock-duration", value_name = "MS")]
    pub lock_duration: Option<u64>,

    /// Complete every task after printing it
    #[arg(long)]
    pub ack: bool,

    /// Stop after this many tasks
    #[arg(long, value_name = "N")]
    pub max_items: Option<usize>,
}

impl OpenArgs {
    /// Subscription parameters: flags first, then the `[subscription]` section.
    pub fn subscription_spec(&self, config: &ClientConfig) -> SubscriptionSpec {
        let mut spec = config.subscription.clone();
        if let Some(topic) = &self.topic {
            spec.topic_name = topic.clone();
        }
        if let Some(partition_id) = self.partition_id {
            spec.partition_id = partition_id;
        }
        if let Some(lock_owner) = &self.lock_owner {
            spec.lock_owner = lock_owner.clone();
        }
        if let Some(task_type) = &self.task_type {
            spec.task_type = task_type.clone();
        }
        if let Some(credits) = self.credits {
            spec.credits = credits;
        }
        if let Some(lock_duration) = self.lock_duration {
            spec.lock_duration_ms = lock_duration;
        }
        spec
    }

    pub async fn run(self, global: &GlobalArgs) -> Result<()> {
        let config = global.load_config()?;
        let spec = self.subscription_spec(&config);
        spec.validate()?;

        let connection = Connection::open(&config).await?;
        let shutdown = CancellationToken::new();
        let mut subscription = connection
            .open_subscription_with_cancellation(spec, shutdown.clone())
            .await?;

        let interrupt = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received interrupt, closing subscription...");
                    shutdown.cancel();
                }
            })
        };

        info!("Waiting for tasks ...");
        let mut delivered = 0usize;
        let mut limit_reached = false;
        while let Some(item) = subscription.next().await {
            println!("{}", serde_json::to_string(&item)?);
            if self.ack {
                subscription.acknowledge(&item, None).await?;
            }

            delivered += 1;
            if self.max_items.is_some_and(|max| delivered >= max) {
                limit_reached = true;
                break;
            }
        }
        interrupt.abort();

        if !limit_reached && !shutdown.is_cancelled() {
            return Err(ClientError::transport(format!(
                "Connection to broker at {} lost after {} task(s)",
                connection.address(),
                delivered
            ))
            .into());
        }

        debug!("Received {} task(s)", delivered);
        if let Err(e) = subscription.close().await {
            warn!("Failed to close subscription: {}", e);
        }
        connection.close().await;
        Ok(())
    }
}

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use zb_broker_mock::{task_backlog, MockBroker, MockBrokerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:51015")]
    listen: String,

    /// Topic the broker knows about (repeatable, default: accept any topic)
    #[arg(long = "topic")]
    topics: Vec<String>,

    /// Number of tasks pushed to each new subscription
    #[arg(long, default_value_t = 0)]
    tasks: usize,

    /// Task type of the pushed tasks
    #[arg(long, default_value = "foo")]
    task_type: String,

    /// Keep pushing tasks even when a subscription has no credits left
    #[arg(long)]
    ignore_credits: bool,

    /// Delay before answering each command, in milliseconds
    #[arg(long, default_value_t = 0)]
    response_delay_ms: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting mock workflow broker");

    let config = MockBrokerConfig {
        topics: args.topics,
        tasks_on_subscribe: task_backlog(&args.task_type, args.tasks),
        honor_credits: !args.ignore_credits,
        close_after_push: false,
        response_delay: Duration::from_millis(args.response_delay_ms),
        slow_responses: if args.response_delay_ms > 0 { usize::MAX } else { 0 },
    };
    let mut broker = MockBroker::bind(&args.listen, config).await?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = broker.serve() => {
            if let Err(e) = result {
                error!("Broker error: {}", e);
                return Err(e);
            }
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    Ok(())
}

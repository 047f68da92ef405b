use std::process;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};
use zb_cli::{Cli, Parser};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.global.log_level));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = cli.run().await {
        error!("{:#}", e);
        process::exit(1);
    }
}

//! Options shared by every command

use anyhow::Result;
use clap::Args;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zb_client::{ClientConfig, DEFAULT_CONFIG_PATH};

#[derive(Args, Clone, Debug)]
pub struct GlobalArgs {
    /// Location of the configuration file
    #[arg(
        short = 'c',
        long = "config",
        visible_alias = "cfg",
        env = "ZBC_CONFIG",
        global = true,
        value_name = "PATH"
    )]
    pub config: Option<PathBuf>,

    /// Broker address, overriding the configuration file
    #[arg(long, global = true, value_name = "HOST:PORT")]
    pub broker: Option<String>,

    /// Log level used when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

impl GlobalArgs {
    /// Resolve the effective client configuration.
    ///
    /// An explicitly named file must exist. The default location is optional;
    /// built-in defaults apply when it is absent.
    pub fn load_config(&self) -> Result<ClientConfig> {
        let config = match &self.config {
            Some(path) => ClientConfig::from_file(path).inspect_err(|_| {
                warn!(
                    "Reading configuration failed. Expecting to find configuration file at {}",
                    path.display()
                );
                warn!("HINT: Try setting the configuration path with: zbctl --config <path to config.toml>");
            })?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                ClientConfig::from_file(DEFAULT_CONFIG_PATH)?
            }
            None => {
                debug!(
                    "No configuration file at {}, using defaults",
                    DEFAULT_CONFIG_PATH
                );
                ClientConfig::default()
            }
        };

        let config = match &self.broker {
            Some(address) => config.with_broker_address(address)?,
            None => config,
        };
        debug!("Using configuration {}", config);
        Ok(config)
    }
}

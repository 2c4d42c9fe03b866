use std::path::PathBuf;

use clap::Parser;
use n0_snafu::Result;
use pkarr_record_relay::{config::Config, server::run_with_config_until_ctrl_c};
use tracing::debug;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Parser, Debug)]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();
    let args = Cli::parse();

    let config = if let Some(path) = args.config {
        debug!("loading config from {:?}", path);
        Config::load(path).await?
    } else {
        debug!("using default config");
        Config::default()
    };

    run_with_config_until_ctrl_c(config).await?;
    Ok(())
}

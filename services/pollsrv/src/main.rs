//! Polling service entry point

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use pollsrv::config::DEFAULT_CONFIG_PATH;
use pollsrv::logging::{self, LogConfig};
use pollsrv::{wait_for_shutdown, PollService, ServiceConfig};

#[derive(Debug, Parser)]
#[command(author, version, about = "Field device polling service")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "POLLSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Only validate configuration without starting service
    #[arg(long)]
    validate: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::load(&args.config)?;

    logging::init(&LogConfig {
        service_name: config.service.name.clone(),
        level: args.log_level.clone(),
        log_dir: config.service.log_dir.as_ref().map(PathBuf::from),
        log_to_file: config.service.log_to_file && !args.validate,
        ansi: !args.no_color,
    })?;
    info!(
        "Loaded {}: {} links, {} controllers",
        args.config.display(),
        config.links.len(),
        config.controllers.len()
    );

    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let service = PollService::start(&config);

    let signal = wait_for_shutdown().await;
    info!("{} received", signal);

    service.shutdown().await;
    Ok(())
}

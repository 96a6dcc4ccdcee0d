use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use analyzer::HttpProvider;
use common::Config;
use pipeline::Ctx;
use queue::RedisBus;
use utils::logger::LoggerConfig;

/// Namespace the bus keys live under; also the exchange the result
/// envelopes are published on.
const BUS_NAMESPACE: &str = "totem";

#[derive(Parser, Debug)]
#[command(name = "totem-dynamic")]
struct Args {
    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config/totem-dynamic.conf")
}

#[tokio::main]
async fn main() -> errors::Result<()> {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(default_config_path);
    let config = Config::load(&config_path)?;

    let mut logger = LoggerConfig::new(config.log_filter_level());
    if let Some(file) = &config.log_file
        && !file.is_empty()
    {
        logger = logger.with_file(file);
    }
    if let Err(e) = utils::logger::init_logger(logger) {
        eprintln!("Could not set up logging: {e}");
    }

    info!("Connecting to bus at {}...", config.bus_uri);
    let bus = Arc::new(RedisBus::new(
        &config.bus_uri,
        BUS_NAMESPACE,
        &config.failed_queue,
    )?);

    let client = analyzer::build_client(config.verify_ssl)?;
    let analyzers = Arc::new(HttpProvider::with_client(client.clone()));

    let ctx = Arc::new(Ctx {
        config: Arc::new(config),
        bus,
        analyzers,
        http: client,
    });

    pipeline::engine::start(ctx).await?;

    // The stages run until the process is told to stop.
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down");

    Ok(())
}

//! Conveyor CI server entrypoint.

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;
mod config;

use app::App;
use config::{LogFormat, ServerConfig};

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(author, version, about = "Conveyor CI server", long_about = None)]
struct Args {
    /// YAML configuration file.
    #[arg(short, long, env = "CONVEYOR_CONFIG")]
    config: Option<PathBuf>,

    /// Address the API listens on.
    #[arg(long)]
    listen: Option<String>,

    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Keep all state in memory.
    #[arg(long)]
    in_memory: bool,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(url) = self.database_url {
            config.database.url = Some(url);
        }
        if self.in_memory {
            config.in_memory = true;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,conveyor=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Plain => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    init_logging(config.log_format);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
    });

    App::build(config).await?.run(shutdown).await
}

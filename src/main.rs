use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::Parser;
use service::Service;

mod background;
mod cache;
mod config;
mod dispatch;
mod error;
mod health;
mod http_objects;
mod integration_test;
mod lifecycle;
mod packager;
mod restore;
mod retry;
mod routes;
mod sandbox;
mod service;
mod snapshots;
mod supervisor;
mod tracing;
mod transfer;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match config::ServerConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error loading config {}: {:?}", path.display(), err);
                std::process::exit(1);
            }
        },
        None => config::ServerConfig::default(),
    };

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            error!("Error setting up tracing: {:?}", err);
            None
        }
    };

    let root_span = info_span!("sandkeep", env = config.env);
    let _guard = root_span.enter();

    match Service::new(config).await {
        Ok(mut service) => {
            if let Err(err) = service.start().await {
                error!("Error starting service: {:?}", err);
            }
        }
        Err(err) => {
            error!("Error creating service: {:?}", err);
        }
    }

    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
}

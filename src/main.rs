// src/main.rs
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use tallyd::config::{Config, ServerKind};
use tallyd::logging;
use tallyd::metrics::Metrics;
use tallyd::processor::RequestProcessor;
use tallyd::router::build_router;
use tallyd::server::{BlockingServer, MultiplexServer, Server};

#[derive(Parser)]
#[command(name = "tallyd")]
#[command(about = "Multiplexing HTTP/1.1 service for JSON record processing")]
#[command(version)]
struct Cli {
    /// YAML configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Server implementation: blocking | multiplexing
    #[arg(long = "server-type")]
    server_type: Option<ServerKind>,

    /// Worker pool size (0 = pick from the machine)
    #[arg(long)]
    workers: Option<usize>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(kind) = cli.server_type {
        config.server_type = kind;
    }
    if let Some(workers) = cli.workers {
        config.worker_threads = workers;
    }

    info!(
        "starting {:?} server on {}",
        config.server_type,
        config.address()
    );

    let metrics = Arc::new(Metrics::new());
    let processor = Arc::new(RequestProcessor::new());
    let router = Arc::new(build_router(Arc::clone(&metrics), Arc::clone(&processor)));

    let outcome = match config.server_type {
        ServerKind::Multiplexing => {
            let server = Arc::new(MultiplexServer::new(config, metrics, processor, router));
            let handler = Arc::clone(&server);
            if let Err(e) = ctrlc::set_handler(move || {
                info!("shutdown signal received");
                handler.request_shutdown();
            }) {
                warn!("could not install signal handler: {}", e);
            }
            server.run()
        }
        ServerKind::Blocking => {
            let server = Arc::new(BlockingServer::new(config, metrics, router));
            let handler = Arc::clone(&server);
            if let Err(e) = ctrlc::set_handler(move || {
                info!("shutdown signal received");
                handler.request_shutdown();
            }) {
                warn!("could not install signal handler: {}", e);
            }
            server.run()
        }
    };

    match outcome {
        Ok(()) => {
            info!("server stopped gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

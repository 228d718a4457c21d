//! chainingest CLI: replay the block archive or follow a live feed.
//!
//! Usage:
//! ```bash
//! chainingest run ingest.json
//! chainingest config
//! chainingest version
//! ```

mod health;
mod pipeline;

use std::env;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainingest_core::{
    CancellationToken, IngestMode, Ingestor, IngestorConfig, LogConfig, ShutdownReason,
};
use chainingest_storage::FsArchiveStore;
use chainingest_ws::WsBlockFeed;

use crate::pipeline::JsonLinesPipeline;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "run" => {
            let Some(path) = args.get(2) else {
                eprintln!("run: missing config file");
                print_usage();
                process::exit(1);
            };
            if let Err(e) = cmd_run(path).await {
                eprintln!("error: {e:#}");
                process::exit(1);
            }
        }
        "config" => cmd_config(),
        "version" | "--version" | "-V" => {
            println!("chainingest {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("chainingest {}", env!("CARGO_PKG_VERSION"));
    println!("Fork-aware block ingestion from an archive and a live feed\n");
    println!("USAGE:");
    println!("    chainingest <COMMAND>\n");
    println!("COMMANDS:");
    println!("    run <config.json>  Run one ingestion, writing blocks as JSON lines");
    println!("    config             Print the default configuration");
    println!("    version            Print version");
    println!("    help               Print this help");
}

fn cmd_config() {
    match serde_json::to_string_pretty(&IngestorConfig::default()) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<IngestorConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let config: IngestorConfig =
        serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_new(config.directives()).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn cmd_run(path: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    init_tracing(&config.log);

    let archive = Arc::new(FsArchiveStore::new(&config.archive_path, config.shard_size));
    let mut builder = Ingestor::builder()
        .config(config.clone())
        .archive(archive)
        .pipeline(Arc::new(JsonLinesPipeline::stdout()));
    if config.mode == IngestMode::Live {
        builder = builder.feed(Arc::new(WsBlockFeed::new()));
    }
    let mut ingestor = builder.build()?;
    let handle = ingestor.handle();

    let server_stop = CancellationToken::new();
    let server = match &config.health_listen_addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid health_listen_addr {addr}"))?;
            let handle = handle.clone();
            let stop = server_stop.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = health::start_health_server(addr, handle, stop).await {
                    tracing::error!(error = %e, "health server failed");
                }
            }))
        }
        None => None,
    };

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            signal_handle.stop(ShutdownReason::Clean);
        }
    });

    ingestor.bootstrap(config.start_block_num).await?;
    let result = ingestor.launch().await;

    server_stop.cancel();
    if let Some(server) = server {
        let _ = server.await;
    }
    result?;
    tracing::info!("ingestion finished");
    Ok(())
}

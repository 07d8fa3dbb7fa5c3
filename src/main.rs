use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use devex::{adapters, config::AppConfig, context::AppContext, logging};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(name = "devex")]
#[command(about = "Device file export and media streaming bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for devices and serve export/streaming requests.
    Serve(ServeArgs),
}

#[derive(Args, Serialize)]
struct ServeArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    export_directory: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Serve(args) => AppConfig::load(Some(args))?,
    };

    logging::init(logging::LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match cli.command {
        Commands::Serve(_) => {
            let ctx = AppContext::new(config);
            run_serve(ctx).await.context("serve loop failed")
        }
    }
}

async fn run_serve(ctx: AppContext) -> Result<()> {
    info!(
        export_directory = %ctx.config.export_directory.display(),
        simulation = ctx.config.simulation,
        "devex starting"
    );

    let (tx, mut rx) = mpsc::channel(32);
    let bus = adapters::get_bus(ctx.config.simulation);
    bus.start(tx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = rx.recv() => {
                match event {
                    Some(event) => ctx.registry.handle_event(event),
                    None => break,
                }
            }
        }
    }

    Ok(())
}

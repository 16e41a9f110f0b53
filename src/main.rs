mod app;
mod cli;
mod config;

use app::MeshApp;
use clap::Parser;
use cli::{Cli, Commands};
use config::AppConfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load()?;
    init_tracing(&config.logging.level, &config.logging.format);

    info!("Configuration loaded successfully");

    match cli.command {
        Some(Commands::Run) | None => {
            run_node(config).await?;
        }
        Some(Commands::Info) => {
            show_info(&config)?;
        }
    }

    Ok(())
}

async fn run_node(config: AppConfig) -> anyhow::Result<()> {
    info!("===================================");
    info!("Handshake Mesh Node Starting");
    info!("===================================");

    let app = MeshApp::new(config)?;
    app.run().await?;

    Ok(())
}

fn show_info(config: &AppConfig) -> anyhow::Result<()> {
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

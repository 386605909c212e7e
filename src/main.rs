//! RecordHub server - Main entry point

use anyhow::Context;
use clap::Parser;
use recordhub::engine::{
    api::{create_router, ApiState},
    cli::{Cli, Commands, OutputFormat},
    config::{Config, CONFIG_FILE},
    source::RecordSource,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("recordhub=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run_cli(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let config_dir = cli.get_config_dir();
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init { name } => cmd_init(&config_dir, &name, json_output),
        Commands::Serve { port, host } => cmd_serve(&config_dir, host, port).await,
        Commands::Status => cmd_status(&config_dir, json_output).await,
    }
}

fn cmd_init(config_dir: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    if config_dir.join(CONFIG_FILE).exists() {
        anyhow::bail!("{} already exists in {}", CONFIG_FILE, config_dir.display());
    }
    std::fs::create_dir_all(config_dir)?;
    let config = Config::default_for_project(name);
    config.save(config_dir)?;

    if json {
        println!("{}", serde_json::json!({ "initialized": true, "name": name }));
    } else {
        println!("Initialized {} in {}", name, config_dir.display());
    }
    Ok(())
}

async fn cmd_serve(config_dir: &Path, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let config = Config::load(config_dir)?;
    let router = config
        .build_router(config_dir)
        .await
        .context("failed to connect sources")?;

    let app = create_router(ApiState::new(Arc::new(router)));

    let addr = format!(
        "{}:{}",
        host.unwrap_or(config.api.host),
        port.unwrap_or(config.api.port)
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(name = %config.name, %addr, "recordhub listening");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn cmd_status(config_dir: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(config_dir)?;
    let router = config.build_router(config_dir).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "name": router.name(),
                "sources": router.sources().iter().map(|s| s.name()).collect::<Vec<_>>(),
                "tables": router.get_table_names(),
                "workflows": router.workflow_names(),
            })
        );
    } else {
        println!("RecordHub: {}", router.name());
        for source in router.sources() {
            println!(
                "   {} ({}): {}",
                source.name(),
                source.backend().kind(),
                source.get_table_names().join(", ")
            );
        }
    }
    Ok(())
}

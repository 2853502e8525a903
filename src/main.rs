//! Switchboard HTTP server - main entry point.
//!
//! Loads configuration, builds the runtime, starts the background sweeper and
//! serves the session API until Ctrl-C.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use switchboard::{Config, Runtime};
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[command(name = "switchboard-server", version, about)]
struct Cli {
    /// JSON config file; defaults apply when omitted.
    #[arg(long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overrides `server.listen_addr`.
    #[arg(long)]
    listen: Option<String>,

    /// Print the config JSON Schema and exit.
    #[arg(long)]
    print_config_schema: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.print_config_schema {
        println!("{}", serde_json::to_string_pretty(&Config::json_schema())?);
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env();
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    switchboard::observability::init_tracing(&config.observability);

    let addr = config.server.listen_addr.clone();
    let runtime = Arc::new(Runtime::from_config(config).await?);
    runtime.start_sweeper();

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "switchboard server starting");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        tracing::info!("shutdown signal received");
    };
    switchboard::http::serve(Arc::clone(&runtime), listener, shutdown).await?;

    runtime.shutdown().await;
    Ok(())
}

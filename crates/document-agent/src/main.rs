// document-agent/src/main.rs

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use document_agent::{config::Config, metrics, run_server, telemetry};

#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "document-agent", version, about = "Document agent WebSocket server")]
struct Args {
    /// Overrides API_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Overrides API_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Overrides DATABASE_PATH.
    #[arg(long)]
    database: Option<std::path::PathBuf>,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init_tracing();

    let mut cfg = Config::from_env()?;
    if let Some(host) = args.host {
        cfg.api_host = host;
    }
    if let Some(port) = args.port {
        cfg.api_port = port;
    }
    if let Some(database) = args.database {
        cfg.database_path = database;
    }

    metrics::init_metrics();
    cfg.print_config();
    run_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}

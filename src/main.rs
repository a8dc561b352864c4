use anyhow::Result;
use clap::Parser;
use senseboard::ai::Engine;
use senseboard::config::Config;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "senseboard",
    about = "Real-time collaborative intelligent whiteboard server",
    version
)]
struct Cli {
    /// Path to senseboard.toml (defaults to ./senseboard.toml, then the
    /// platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override server.port from the config
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    init_tracing(&config.logging.level);

    let engine = Engine::new(config)?;
    tracing::info!(
        provider = ?engine.config.ai.provider,
        port = engine.config.server.port,
        "starting senseboard"
    );
    senseboard::web::run_server(engine).await
}

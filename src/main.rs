// src/main.rs — Gateway entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use copilot_fanout::api::{self, ApiState};
use copilot_fanout::gateway::Gateway;
use copilot_fanout::infra::config::Config;
use copilot_fanout::infra::logger;

#[derive(Parser)]
#[command(name = "copilot-fanout", version, about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 15432)]
    port: u16,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logger::init_logging(&cli.log_level);

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load_from(&cli.config)?;
    tracing::info!(
        providers = config.providers.len(),
        record_traffic = config.record_traffic,
        "configuration loaded from {}",
        cli.config.display()
    );

    let master_key = config.master_key.clone();
    let gateway = Gateway::from_config(&config)?;

    let state = ApiState {
        gateway: Arc::new(gateway),
        master_key,
    };

    api::start_server(&cli.host, cli.port, state).await
}

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use eg_config::GatewayConfig;
use eg_runtime::lifecycle::{Gateway, wait_for_signal};
use eg_runtime::tracing_init::init_tracing;

#[derive(Parser)]
#[command(name = "edgegate", about = "EdgeGate IoT edge gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Run {
        /// Path to edgegate.toml config file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate the configuration and rule set, then exit
    Check {
        /// Path to edgegate.toml config file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config_path = config
                .canonicalize()
                .map_err(|e| anyhow::anyhow!("config path '{}': {e}", config.display()))?;
            let gateway_config = GatewayConfig::load(&config_path)?;
            let base_dir = config_path
                .parent()
                .expect("config path must have a parent directory");

            let _guard = init_tracing(&gateway_config.logging, base_dir)?;

            let gateway = Gateway::start(gateway_config, base_dir)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            tracing::info!(domain = "sys", "EdgeGate gateway started");

            wait_for_signal(gateway.cancel_token()).await;
            gateway.shutdown();
            gateway.wait().await.map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        Commands::Check { config } => {
            let config_path = config
                .canonicalize()
                .map_err(|e| anyhow::anyhow!("config path '{}': {e}", config.display()))?;
            let gateway_config = GatewayConfig::load(&config_path)?;
            let base_dir = config_path
                .parent()
                .expect("config path must have a parent directory");

            let rules_dir = base_dir.join(&gateway_config.gateway.rules_dir);
            let rules = eg_core::rule::load_rules_dir(&rules_dir)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let count = rules.len();
            eg_core::rule::RuleSet::compile(rules, 1).map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("configuration ok: {count} rules compile");
        }
    }

    Ok(())
}

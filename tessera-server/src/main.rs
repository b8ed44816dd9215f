mod config;
use clap::{Parser, Subcommand};
use config::Config;
use std::collections::BTreeMap;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use server::run_server;
use tessera_core::compute_cluster_assignment;

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Partitioned key-value serving node fed by a change-log")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Print the partition assignment computed from the cluster section
    Assignment {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Tessera server with config: {}", config);

            let cfg = load_config(&config);
            tracing::info!(
                "Node ID: {}, Bind: {}, Stores: {}, Strategy: {:?}",
                cfg.node_id,
                cfg.bind_addr,
                cfg.cluster.stores.len(),
                cfg.cluster.assignment_strategy
            );

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Assignment { config } => {
            let cfg = load_config(&config);
            if let Err(e) = print_assignment(&cfg) {
                tracing::error!("Failed to compute assignment: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_assignment(config: &Config) -> anyhow::Result<()> {
    let scheme = config.cluster.assignment_strategy.scheme();
    let cluster = compute_cluster_assignment(
        scheme.as_ref(),
        &config.cluster.stores,
        &config.cluster.live_nodes,
    )?;

    let by_version: BTreeMap<String, _> = cluster
        .into_iter()
        .map(|(store_version, assignment)| (store_version.to_string(), assignment))
        .collect();
    println!("{}", serde_json::to_string_pretty(&by_version)?);
    Ok(())
}

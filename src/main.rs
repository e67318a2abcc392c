//! Dotmesh Server - Snapshot Volume Replication Node
//!
//! Runs one node of a dotmesh cluster: per-volume state machines, the
//! replication endpoints and the cluster cache refresher.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dotmesh::api::HttpServer;
use dotmesh::cluster::CacheRefresher;
use dotmesh::config::DotmeshConfig;
use dotmesh::context::{Collaborators, NodeContext};
use dotmesh::error::Result;

/// Dotmesh Server - Snapshot Volume Replication Node
#[derive(Parser)]
#[command(name = "dotmesh-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dotmesh.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "dotmesh.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting dotmesh node...");

    // Load configuration
    let config = match DotmeshConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    // Ensure directories exist
    if let Err(e) = std::fs::create_dir_all(config.metadata_dir()) {
        tracing::error!("Failed to create metadata directory {:?}: {}", config.metadata_dir(), e);
        return Err(e.into());
    }

    let collaborators = Collaborators::from_config(&config)?;
    let ctx = NodeContext::new(config, collaborators)?;

    let refresher = CacheRefresher::new(Arc::clone(&ctx));
    if let Err(e) = refresher.refresh_once().await {
        tracing::warn!("Initial cluster cache refresh failed: {}", e);
    }
    tracing::info!(
        "Cluster cache loaded: {} volumes, {} mastered here",
        ctx.cache.known_volumes().len(),
        ctx.cache.mastered_volumes().len()
    );

    let shutdown = CancellationToken::new();
    let refresh_task = tokio::spawn(refresher.run(shutdown.clone()));

    let server = HttpServer::new(Arc::clone(&ctx));
    let outcome = tokio::select! {
        result = server.start(shutdown.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    };
    if let Err(e) = &outcome {
        tracing::error!("HTTP API failed: {}", e);
    }

    shutdown.cancel();
    if let Err(e) = refresh_task.await {
        tracing::warn!("Cache refresher ended abnormally: {}", e);
    }
    ctx.shutdown();
    tracing::info!("Node {} stopped", ctx.node_id);

    outcome
}

/// Generate a configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# Dotmesh Configuration
# Generated configuration file

[node]
id = "{node_id}"
data_dir = "/var/lib/dotmesh/{node_id}"

[api]
enabled = true
bind_address = "0.0.0.0:32607"
peer_port = 32607
connect_timeout_secs = 10
cors_enabled = false

[engine]
binary = "zfs"
pool = "pool"
prefix = "dmfs"

[cluster]
refresh_interval_ms = 1000
address_selection = "first"
# address_selection = "round_robin"

[[cluster.nodes]]
id = "{node_id}"
addresses = ["127.0.0.1"]

# [[cluster.volumes]]
# id = "0b9a1d7e-volume-id"
# master = "{node_id}"

[transfer]
service_user = "admin"
progress_depth = 16
retained_results = 256

[transfer.retry]
policy = "fail_fast"
# policy = "backoff"
# max_attempts = 5
# initial_backoff_ms = 200
# max_backoff_ms = 5000

[secrets]
file = "/var/lib/dotmesh/passwords.json"

[logging]
level = "info"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your cluster nodes and engine pool.");
    println!("Then start with: dotmesh-server start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match DotmeshConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.api.bind_address);
            println!("  Engine: {} ({}/{})", config.engine.binary, config.engine.pool, config.engine.prefix);
            println!("  Nodes: {}", config.cluster.nodes.len());
            println!("  Volumes: {}", config.cluster.volumes.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = DotmeshConfig::from_file(&config_path)?;

    println!("Dotmesh Node Information");
    println!("========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.api.bind_address);
    println!("Data Directory:   {}", config.node.data_dir.display());
    println!("Metadata:         {}", config.metadata_dir().display());
    println!();
    println!("Engine Configuration:");
    println!("  Binary:         {}", config.engine.binary);
    println!("  Pool:           {}", config.engine.pool);
    println!("  Prefix:         {}", config.engine.prefix);
    println!();
    println!("Cluster Configuration:");
    println!("  Refresh:        {} ms", config.cluster.refresh_interval_ms);
    println!("  Selection:      {:?}", config.cluster.address_selection);
    for node in &config.cluster.nodes {
        println!("  Node {:<10} {:?}", node.id, node.addresses);
    }
    println!();
    println!("Transfer Configuration:");
    println!("  Service User:   {}", config.transfer.service_user);
    println!("  Retry:          {:?}", config.transfer.retry);
    println!("  Kept Results:   {}", config.transfer.retained_results);

    Ok(())
}

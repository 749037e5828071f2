//! WolfGate - MySQL Proxy Control Plane
//!
//! Runs the backend health monitor and the admin API, and offers a few
//! offline helpers for configuration and sharding files.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfgate::admin::AdminService;
use wolfgate::api::HttpServer;
use wolfgate::config::WolfGateConfig;
use wolfgate::context::ProxyContext;
use wolfgate::error::Result;
use wolfgate::monitor::{HealthMonitor, MonitorSettings, MySqlProber};
use wolfgate::sharding::ShardingConfig;

/// WolfGate - MySQL Proxy Control Plane
#[derive(Parser)]
#[command(name = "wolfgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfgate.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control plane (health monitor and admin API)
    Start,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfgate.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "gate-1")]
        node_id: String,
    },

    /// Validate a sharding JSON file without touching any server
    CheckSharding {
        /// Sharding config file
        file: PathBuf,

        /// Number of backend groups the vdbs must cover
        #[arg(short, long)]
        groups: usize,

        /// Validate as partition mode
        #[arg(long)]
        partition_mode: bool,
    },

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The config file may not exist yet (init), so fall back to pretty output
    let format = WolfGateConfig::from_file(&cli.config)
        .map(|c| c.logging.format)
        .unwrap_or_else(|_| "pretty".to_string());
    init_logging(&cli.log_level, &format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Validate => run_validate(cli.config),
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::CheckSharding {
            file,
            groups,
            partition_mode,
        } => run_check_sharding(file, groups, partition_mode),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the control plane
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfGate...");

    let config = match WolfGateConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    let ctx = match ProxyContext::from_config(&config).await {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            tracing::error!("Failed to initialize proxy context: {}", e);
            return Err(e);
        }
    };
    tracing::info!(
        "{} backends in {} groups, {} vdbs",
        ctx.registry().count(),
        ctx.registry().group_count(),
        ctx.sharding().vdbs().len()
    );

    // Health monitor
    let monitor = if config.monitor.enabled {
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(ctx.registry()),
            MySqlProber::from_config(&config),
            MonitorSettings::from_config(&config),
        ));
        let handle = monitor.start();
        Some((monitor, handle))
    } else {
        tracing::info!("Health monitor disabled");
        None
    };

    // Admin API
    let http_server = HttpServer::new(
        config.api.clone(),
        config.node.id.clone(),
        AdminService::new(Arc::clone(&ctx)),
        monitor.as_ref().map(|(m, _)| m.stats_handle()),
    );
    let api_handle = tokio::spawn(async move {
        if let Err(e) = http_server.start().await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tracing::info!("WolfGate is running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        _ = api_handle => {
            tracing::warn!("HTTP API stopped");
        }
    }

    if let Some((monitor, handle)) = monitor {
        monitor.stop();
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            tracing::warn!("Health monitor did not stop in time");
        }
    }

    tracing::info!("WolfGate stopped");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    if output.exists() {
        eprintln!("✗ {} already exists, not overwriting", output.display());
        return Err(wolfgate::Error::Config(format!("{} already exists", output.display())));
    }

    let content = format!(
        "# WolfGate Configuration\n# Generated configuration file\n\n{}",
        WolfGateConfig::sample(&node_id)
    );
    std::fs::write(&output, content)?;

    println!("✓ Configuration written to {}", output.display());
    println!("  Edit [probe] credentials and [backends] before starting");
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfGateConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  RW backends: {}", config.backends.rw.len());
            println!("  RO backends: {}", config.backends.ro.len());
            println!("  Monitor: {}", if config.monitor.enabled { "enabled" } else { "disabled" });
            println!("  Sharding: {}", if config.sharding.enabled { "enabled" } else { "disabled" });
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Validate a sharding file offline
fn run_check_sharding(file: PathBuf, groups: usize, partition_mode: bool) -> Result<()> {
    let content = std::fs::read_to_string(&file)?;
    let sharding = ShardingConfig::new(partition_mode);

    if let Err(e) = sharding.load_str(&content, groups) {
        eprintln!("✗ Sharding config error: {}", e);
        return Err(e);
    }

    println!("✓ Sharding config is valid");
    for vdb in sharding.vdbs() {
        println!(
            "  vdb {} ({} on {}): {}",
            vdb.id(),
            vdb.method(),
            vdb.key_type(),
            vdb.describe_partitions()
        );
    }
    for table in sharding.sharded_tables() {
        println!("  table {}.{} -> vdb {} by {}", table.schema, table.table, table.vdb_id, table.shard_key);
    }
    for table in sharding.single_tables() {
        println!("  single table {}.{} -> {}", table.schema, table.table, table.group);
    }
    Ok(())
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfGateConfig::from_file(&config_path)?;
    let m = &config.monitor;

    println!("WolfGate Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Object Store:     {:?} at {}", config.store.kind, config.store.path.display());
    println!();
    println!("Backends:");
    println!("  RW:             {:?}", config.backends.rw);
    println!("  RO:             {:?}", config.backends.ro);
    println!("  Partition Mode: {}", config.backends.partition_mode);
    println!("  Idle Conns:     {}/{}/{} (max/mid/min)",
        config.backends.max_idle_connections,
        config.backends.mid_idle_connections,
        config.backends.min_idle_connections);
    println!();
    println!("Monitor:");
    println!("  Enabled:        {}", m.enabled);
    println!("  Check Interval: {} ms", m.check_interval_ms);
    println!("  Group Repl.:    {}", m.group_replication);
    println!("  Slave Delay:    {} (down > {}s, up <= {}s, every {} ms)",
        m.check_slave_delay, m.slave_delay_down_secs, m.slave_delay_recover_secs, m.delay_interval_ms);
    println!();
    println!("API:              {} ({})",
        config.api.bind_address,
        if config.api.enabled { "enabled" } else { "disabled" });

    Ok(())
}

//! Steward - Automated Failover for Replicated PostgreSQL
//!
//! One binary, two behaviors: `steward run` starts either the monitor or
//! the keeper, selected by the `role` key of the configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use steward::api::HttpServer;
use steward::config::{ProcessRole, StewardConfig};
use steward::error::exit_codes;
use steward::keeper::Keeper;
use steward::monitor::health::{HealthConfig, HealthScanner};
use steward::monitor::orchestrator::{Orchestrator, OrchestratorConfig};
use steward::monitor::{MonitorService, MonitorStore};
use steward::net::ProtocolServer;
use steward::Result;

/// Steward - Automated Failover for Replicated PostgreSQL
#[derive(Parser)]
#[command(name = "steward")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "steward.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the process configured in the config file (monitor or keeper)
    Run,

    /// Initialize a new configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "steward.toml")]
        output: PathBuf,

        /// Process role: monitor or keeper
        #[arg(long, default_value = "keeper")]
        role: String,

        /// Node name, unique within the formation
        #[arg(long, default_value = "node-1")]
        name: String,

        /// Hostname peers use to reach this node
        #[arg(long, default_value = "localhost")]
        hostname: String,

        /// Monitor address (host:port) for keeper configs
        #[arg(long, default_value = "localhost:6000")]
        monitor: String,

        /// PostgreSQL data directory for keeper configs
        #[arg(long, default_value = "/var/lib/postgresql/data")]
        pgdata: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

fn main() {
    let exit_code = match run_main() {
        Ok(()) => exit_codes::OK,
        Err(e) => {
            eprintln!("steward: {e}");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

#[tokio::main]
async fn run_main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run => run_process(cli.config).await,
        Commands::Init {
            output,
            role,
            name,
            hostname,
            monitor,
            pgdata,
        } => run_init(output, &role, &name, &hostname, &monitor, &pgdata),
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

/// Start the configured process
async fn run_process(config_path: PathBuf) -> Result<()> {
    let config = match StewardConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    match config.steward.role {
        ProcessRole::Monitor => run_monitor(config).await,
        ProcessRole::Keeper => run_keeper(config).await,
    }
}

/// Start the monitor: durable store, orchestrator, protocol server,
/// health scanner, HTTP API
async fn run_monitor(config: StewardConfig) -> Result<()> {
    tracing::info!("starting steward monitor");

    let store = Arc::new(MonitorStore::new(&config.steward.data_dir)?);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        OrchestratorConfig {
            failover_timeout: chrono::Duration::seconds(config.monitor.failover_timeout as i64),
            demote_timeout: chrono::Duration::seconds(config.monitor.demote_timeout as i64),
        },
    ));

    let service = Arc::new(MonitorService::new(Arc::clone(&orchestrator)));
    let server = ProtocolServer::new(config.monitor.listen_address.clone(), service.into_handler());

    let scanner = HealthScanner::new(
        Arc::clone(&orchestrator),
        HealthConfig {
            interval: std::time::Duration::from_secs(config.monitor.health_check_interval),
            max_retries: config.monitor.health_check_max_retries,
            failover_timeout: chrono::Duration::seconds(config.monitor.failover_timeout as i64),
        },
    );

    let http = HttpServer::new(config.monitor.http_address.clone(), Arc::clone(&orchestrator));

    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                tracing::error!("protocol server error: {}", e);
                return Err(e);
            }
        }
        result = scanner.start() => {
            if let Err(e) = result {
                tracing::error!("health scanner error: {}", e);
                return Err(e);
            }
        }
        result = http.start() => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    tracing::info!("steward monitor shutdown complete");
    Ok(())
}

/// Start the keeper loop
async fn run_keeper(config: StewardConfig) -> Result<()> {
    tracing::info!(
        "starting steward keeper for {}",
        config.postgres.pgdata.display()
    );
    let keeper = Keeper::new(config)?;
    keeper.run().await
}

/// Initialize configuration file
fn run_init(
    output: PathBuf,
    role: &str,
    name: &str,
    hostname: &str,
    monitor: &str,
    pgdata: &str,
) -> Result<()> {
    let config_content = match role {
        "monitor" => String::from(
            r#"# Steward monitor configuration

[steward]
role = "monitor"
data_dir = "/var/lib/steward/monitor"

[monitor]
listen_address = "0.0.0.0:6000"
http_address = "0.0.0.0:6001"
failover_timeout = 20
health_check_interval = 5
health_check_timeout = 5
health_check_max_retries = 2
demote_timeout = 30

[logging]
level = "info"
format = "pretty"
# file = "/var/log/steward/monitor.log"
"#
        ),
        "keeper" => format!(
            r#"# Steward keeper configuration

[steward]
role = "keeper"
monitor = "{monitor}"
formation = "default"
name = "{name}"
hostname = "{hostname}"
nodekind = "standalone"
data_dir = "/var/lib/steward/{name}"

[postgres]
pgdata = "{pgdata}"
host = "/tmp"
port = 5432
user = "postgres"
dbname = "postgres"

[replication]
# maximum_backup_rate = "100M"
backup_directory = "backup"

[timeout]
keeper_sleep_time = 5
network_partition_timeout = 20
prepare_promotion_catchup = 30
prepare_promotion_walreceiver = 30
postgresql_restart_failure_timeout = 20
postgresql_restart_failure_max_retries = 3

[ssl]
mode = "prefer"
self_signed = false

[logging]
level = "info"
format = "pretty"
"#
        ),
        other => {
            return Err(steward::Error::Config(format!(
                "unknown role {other}, expected monitor or keeper"
            )))
        }
    };

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file, then start with: steward run --config {}", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match StewardConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Role: {}", config.steward.role);
            if config.steward.role == ProcessRole::Keeper {
                println!("  Name: {}", config.steward.name.as_deref().unwrap_or("-"));
                println!("  Formation: {}", config.steward.formation);
                println!("  Monitor: {}", config.steward.monitor.as_deref().unwrap_or("-"));
                println!("  PGDATA: {}", config.postgres.pgdata.display());
            } else {
                println!("  Listen: {}", config.monitor.listen_address);
                println!("  HTTP: {}", config.monitor.http_address);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {e}");
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = StewardConfig::from_file(&config_path)?;

    println!("Steward Node Information");
    println!("========================");
    println!();
    println!("Role:             {}", config.steward.role);
    match config.steward.role {
        ProcessRole::Keeper => {
            println!("Name:             {}", config.steward.name.as_deref().unwrap_or("-"));
            println!("Hostname:         {}", config.steward.hostname.as_deref().unwrap_or("-"));
            println!("Formation:        {}", config.steward.formation);
            println!("Monitor:          {}", config.steward.monitor.as_deref().unwrap_or("-"));
            println!();
            println!("PostgreSQL:");
            println!("  PGDATA:         {}", config.postgres.pgdata.display());
            println!("  Port:           {}", config.postgres.port);
            println!("  Database:       {}", config.postgres.dbname);
            println!();
            println!("Timeouts:");
            println!("  Tick:           {} s", config.timeout.keeper_sleep_time);
            println!("  Partition:      {} s", config.timeout.network_partition_timeout);
        }
        ProcessRole::Monitor => {
            println!("Listen:           {}", config.monitor.listen_address);
            println!("HTTP:             {}", config.monitor.http_address);
            println!("Failover timeout: {} s", config.monitor.failover_timeout);
            println!("Demote timeout:   {} s", config.monitor.demote_timeout);
        }
    }

    Ok(())
}

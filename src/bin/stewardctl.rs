//! StewardCtl - Command line tool for operating steward formations
//!
//! Usage:
//!   stewardctl show state        - Show every node's reported and goal role
//!   stewardctl show settings     - Show a formation's replication policy
//!   stewardctl perform failover  - Controlled switchover of a group
//!   stewardctl enable maintenance / disable maintenance
//!   stewardctl drop node         - Remove a node from its group

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// Steward Formation Control Tool
#[derive(Parser)]
#[command(name = "stewardctl")]
#[command(about = "Operate and inspect steward formations", long_about = None)]
struct Cli {
    /// Path to the monitor config file
    #[arg(short, long, default_value = "/etc/steward/monitor.toml")]
    config: PathBuf,

    /// Monitor HTTP endpoint (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cluster state
    Show {
        #[command(subcommand)]
        what: ShowSubcommand,
    },
    /// Change formation or node settings
    Set {
        #[command(subcommand)]
        what: SetSubcommand,
    },
    /// Enable a feature
    Enable {
        #[command(subcommand)]
        what: ToggleSubcommand,
    },
    /// Disable a feature
    Disable {
        #[command(subcommand)]
        what: ToggleSubcommand,
    },
    /// Run an orchestrated operation
    Perform {
        #[command(subcommand)]
        what: PerformSubcommand,
    },
    /// Remove cluster members
    Drop {
        #[command(subcommand)]
        what: DropSubcommand,
    },
}

#[derive(Subcommand)]
enum ShowSubcommand {
    /// List every node with its reported and goal role
    State {
        /// Restrict to one formation
        #[arg(long)]
        formation: Option<String>,
    },
    /// Show a formation's replication policy
    Settings {
        #[arg(long, default_value = "default")]
        formation: String,
    },
}

#[derive(Subcommand)]
enum SetSubcommand {
    /// Formation-wide number of synchronous standbys
    FormationSettings {
        #[arg(long, default_value = "default")]
        formation: String,

        #[arg(long)]
        number_sync_standbys: i32,
    },
    /// Per-node election settings
    NodeSettings {
        #[arg(long)]
        node_id: i64,

        #[arg(long)]
        candidate_priority: Option<i32>,

        #[arg(long)]
        replication_quorum: Option<bool>,
    },
}

#[derive(Subcommand)]
enum ToggleSubcommand {
    /// Standby maintenance pause
    Maintenance {
        #[arg(long)]
        node_id: i64,
    },
    /// Whether the formation accepts standbys
    Secondary {
        #[arg(long, default_value = "default")]
        formation: String,
    },
}

#[derive(Subcommand)]
enum PerformSubcommand {
    /// Controlled switchover of one group
    Failover {
        #[arg(long, default_value = "default")]
        formation: String,

        #[arg(long, default_value = "0")]
        group: i32,
    },
}

#[derive(Subcommand)]
enum DropSubcommand {
    /// Remove a node from its group
    Node {
        #[arg(long)]
        node_id: i64,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StateResponse {
    nodes: Vec<NodeRow>,
}

#[derive(Debug, Deserialize)]
struct NodeRow {
    formation: String,
    group_id: i32,
    node_id: i64,
    name: String,
    host: String,
    port: u16,
    current_role: String,
    assigned_role: String,
    reported_lsn: String,
    health: String,
    candidate_priority: i32,
    replication_quorum: bool,
}

#[derive(Debug, Deserialize)]
struct SettingsResponse {
    formation: String,
    kind: String,
    dbname: String,
    has_secondary: bool,
    number_sync_standbys: i32,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    success: bool,
    #[serde(default)]
    message: String,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    monitor: MonitorSection,
}

#[derive(Debug, Deserialize, Default)]
struct MonitorSection {
    #[serde(default = "default_http_address")]
    http_address: String,
}

fn default_http_address() -> String {
    "0.0.0.0:6001".to_string()
}

// ============ Main ============

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let endpoint = resolve_endpoint(&cli);
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Show { what } => match what {
            ShowSubcommand::State { formation } => show_state(&client, &endpoint, formation).await,
            ShowSubcommand::Settings { formation } => {
                show_settings(&client, &endpoint, &formation).await
            }
        },
        Commands::Set { what } => match what {
            SetSubcommand::FormationSettings {
                formation,
                number_sync_standbys,
            } => {
                post_ack(
                    &client,
                    format!("{endpoint}/formations/{formation}/settings"),
                    &serde_json::json!({ "number_sync_standbys": number_sync_standbys }),
                )
                .await
            }
            SetSubcommand::NodeSettings {
                node_id,
                candidate_priority,
                replication_quorum,
            } => {
                post_ack(
                    &client,
                    format!("{endpoint}/nodes/{node_id}/settings"),
                    &serde_json::json!({
                        "candidate_priority": candidate_priority,
                        "replication_quorum": replication_quorum,
                    }),
                )
                .await
            }
        },
        Commands::Enable { what } => toggle(&client, &endpoint, what, true).await,
        Commands::Disable { what } => toggle(&client, &endpoint, what, false).await,
        Commands::Perform { what } => match what {
            PerformSubcommand::Failover { formation, group } => {
                post_ack(
                    &client,
                    format!("{endpoint}/formations/{formation}/groups/{group}/failover"),
                    &serde_json::json!({}),
                )
                .await
            }
        },
        Commands::Drop { what } => match what {
            DropSubcommand::Node { node_id } => {
                let response = client
                    .delete(format!("{endpoint}/nodes/{node_id}"))
                    .send()
                    .await
                    .context("monitor unreachable")?;
                finish_ack(response).await
            }
        },
    }
}

/// Resolve the monitor endpoint from --endpoint or the config file
fn resolve_endpoint(cli: &Cli) -> String {
    if let Some(endpoint) = &cli.endpoint {
        return normalize_endpoint(endpoint);
    }
    if cli.config.exists() {
        if let Ok(content) = std::fs::read_to_string(&cli.config) {
            if let Ok(config) = toml::from_str::<Config>(&content) {
                return normalize_endpoint(&config.monitor.http_address);
            }
        }
    }
    "http://127.0.0.1:6001".to_string()
}

fn normalize_endpoint(address: &str) -> String {
    let address = if let Some(rest) = address.strip_prefix("0.0.0.0") {
        format!("127.0.0.1{rest}")
    } else {
        address.to_string()
    };
    if address.starts_with("http") {
        address
    } else {
        format!("http://{address}")
    }
}

async fn show_state(
    client: &reqwest::Client,
    endpoint: &str,
    formation: Option<String>,
) -> anyhow::Result<()> {
    let mut request = client.get(format!("{endpoint}/state"));
    if let Some(formation) = &formation {
        request = request.query(&[("formation", formation)]);
    }
    let state: StateResponse = request
        .send()
        .await
        .context("monitor unreachable")?
        .json()
        .await
        .context("malformed state response")?;

    if state.nodes.is_empty() {
        println!("No nodes registered.");
        return Ok(());
    }

    println!(
        "{:<12} {:>5} {:>4}  {:<12} {:<24} {:<18} {:<18} {:>12} {:<8} {:>4} {:>6}",
        "Formation", "Group", "ID", "Name", "Host:Port", "Reported", "Assigned", "LSN", "Health",
        "Prio", "Quorum"
    );
    println!("{}", "-".repeat(132));
    for node in &state.nodes {
        println!(
            "{:<12} {:>5} {:>4}  {:<12} {:<24} {:<18} {:<18} {:>12} {:<8} {:>4} {:>6}",
            node.formation,
            node.group_id,
            node.node_id,
            node.name,
            format!("{}:{}", node.host, node.port),
            node.current_role,
            node.assigned_role,
            node.reported_lsn,
            node.health,
            node.candidate_priority,
            node.replication_quorum,
        );
    }
    Ok(())
}

async fn show_settings(
    client: &reqwest::Client,
    endpoint: &str,
    formation: &str,
) -> anyhow::Result<()> {
    let settings: SettingsResponse = client
        .get(format!("{endpoint}/formations/{formation}/settings"))
        .send()
        .await
        .context("monitor unreachable")?
        .json()
        .await
        .context("malformed settings response")?;

    println!("Formation:            {}", settings.formation);
    println!("Kind:                 {}", settings.kind);
    println!("Database:             {}", settings.dbname);
    println!("Has secondary:        {}", settings.has_secondary);
    println!("Number sync standbys: {}", settings.number_sync_standbys);
    Ok(())
}

async fn toggle(
    client: &reqwest::Client,
    endpoint: &str,
    what: ToggleSubcommand,
    enabled: bool,
) -> anyhow::Result<()> {
    match what {
        ToggleSubcommand::Maintenance { node_id } => {
            post_ack(
                client,
                format!("{endpoint}/nodes/{node_id}/maintenance"),
                &serde_json::json!({ "enabled": enabled }),
            )
            .await
        }
        ToggleSubcommand::Secondary { formation } => {
            post_ack(
                client,
                format!("{endpoint}/formations/{formation}/secondary"),
                &serde_json::json!({ "enabled": enabled }),
            )
            .await
        }
    }
}

async fn post_ack(
    client: &reqwest::Client,
    url: String,
    body: &serde_json::Value,
) -> anyhow::Result<()> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .context("monitor unreachable")?;
    finish_ack(response).await
}

async fn finish_ack(response: reqwest::Response) -> anyhow::Result<()> {
    let status = response.status();
    let ack: AckResponse = response.json().await.context("malformed response")?;
    if !status.is_success() || !ack.success {
        bail!("monitor refused: {}", ack.message);
    }
    println!("ok");
    Ok(())
}

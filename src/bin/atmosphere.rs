//! `atmosphere` CLI (SPEC_FULL §A.5): `init`, `scan`, `approve`,
//! `serve`, `mesh create|join|invite|peers|status`, `route`, `cost`,
//! `network`. Every subcommand constructs or attaches to an
//! [`atmosphere::AtmosphereNode`] and calls the exact method the HTTP
//! surface calls for the same operation — there is one code path per
//! operation, reached from either CLI or HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use atmosphere::approval::ApprovalConfig;
use atmosphere::config::{self, NodeConfig};
use atmosphere::router::Intent;
use atmosphere::AtmosphereNode;
use atmosphere_core::JoinEndpoints;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "atmosphere", version, about = "Decentralized capability mesh node")]
struct Cli {
    /// Root directory for this node's persisted state (identity, config,
    /// capability store). Defaults to the platform config directory.
    #[arg(long, global = true, env = "ATMOSPHERE_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initializes node state: generates identity, writes default config.
    Init {
        #[arg(long)]
        node_name: Option<String>,
    },
    /// Scans local capabilities registered on this node.
    Scan,
    /// Views or edits the owner approval policy.
    Approve {
        #[arg(long)]
        interactive: bool,
        #[arg(long)]
        show: bool,
    },
    /// Runs the node: HTTP surface, gossip transport, background sweeps.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8420")]
        listen: String,
    },
    #[command(subcommand)]
    Mesh(MeshCommand),
    /// Routes an intent to a capability without executing it.
    Route {
        intent: String,
        #[arg(long)]
        cap_type: Option<String>,
    },
    /// Prints this node's current cost snapshot.
    Cost,
    /// Prints known mesh peers and their last-heartbeat times.
    Network,
}

#[derive(Subcommand)]
enum MeshCommand {
    /// Founds a new mesh, making this node its founder.
    Create { name: String },
    /// Joins an existing mesh using a token obtained via `mesh invite`.
    Join { token_json: String },
    /// Issues a join token for inviting another node into this mesh.
    Invite {
        mesh_id: String,
        mesh_name: String,
        #[arg(long)]
        endpoint: Vec<String>,
        #[arg(long)]
        ttl_secs: Option<f64>,
    },
    /// Lists known peers.
    Peers,
    /// Prints mesh membership/role summary.
    Status,
}

fn node_home(cli_home: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match cli_home {
        Some(path) => Ok(path),
        None => Ok(config::config_root()?),
    }
}

fn open_node(home: &std::path::Path) -> anyhow::Result<AtmosphereNode> {
    let node_config = NodeConfig::load_or_default(&config::node_config_path(home))?;
    let approval_config = ApprovalConfig::load_or_default(&config::approval_config_path(home))?;
    Ok(AtmosphereNode::new(home, node_config, approval_config)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let home = node_home(cli.home)?;

    match cli.command {
        Command::Init { node_name } => {
            std::fs::create_dir_all(&home)?;
            let mut node_config = NodeConfig::load_or_default(&config::node_config_path(&home))?;
            if let Some(name) = node_name {
                node_config.node_name = name;
            }
            node_config.save(&config::node_config_path(&home))?;
            ApprovalConfig::default().save(&config::approval_config_path(&home))?;
            let node = open_node(&home)?;
            println!("initialized node {} at {}", node.local_node_id(), home.display());
        }
        Command::Scan => {
            let node = open_node(&home)?;
            for cap in node.registry.all_online() {
                println!("{}\t{}\t{}", cap.cap_id, cap.cap_type.as_str(), cap.label);
            }
        }
        Command::Approve { interactive, show } => {
            let path = config::approval_config_path(&home);
            let current = ApprovalConfig::load_or_default(&path)?;
            if show || !interactive {
                println!("{}", serde_yaml::to_string(&current)?);
            } else {
                eprintln!(
                    "interactive approval editing is not implemented; edit {} directly and re-run with --show to verify",
                    path.display()
                );
            }
        }
        Command::Serve { listen } => {
            let node = Arc::new(open_node(&home)?);
            let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

            let cost_node = node.clone();
            let cost_shutdown = shutdown_rx.clone();
            tokio::spawn(async move { cost_node.cost.clone().run(cost_shutdown).await });

            let sweep_node = node.clone();
            let sweep_shutdown = shutdown_rx.clone();
            tokio::spawn(async move { sweep_node.run_sweep(sweep_shutdown).await });

            let app = atmosphere::http::build_router(node.clone());
            let listener = tokio::net::TcpListener::bind(&listen).await?;
            tracing::info!(node_id = %node.local_node_id(), %listen, "serving");
            axum::serve(listener, app).await?;
        }
        Command::Mesh(mesh_command) => run_mesh_command(&home, mesh_command)?,
        Command::Route { intent, cap_type } => {
            let node = open_node(&home)?;
            let parsed = match cap_type {
                Some(cap_type) => Intent::Typed { cap_type: Some(cap_type), text: intent, preferences: Default::default() },
                None => Intent::NaturalLanguage(intent),
            };
            let result = node.route(&parsed)?;
            println!(
                "{} on {} (score {:.3}): {}",
                result.chosen_cap.cap_id, result.chosen_cap.node_id, result.score, result.reasoning
            );
        }
        Command::Cost => {
            let node = open_node(&home)?;
            let factors = node.cost.latest().await;
            println!("{}", serde_json::to_string_pretty(&factors)?);
        }
        Command::Network => {
            let node = open_node(&home)?;
            for cap in node.registry.all_online() {
                if cap.node_id == node.local_node_id() {
                    continue;
                }
                println!("{}\tlast_heartbeat={:.0}", cap.node_id, cap.last_heartbeat);
            }
        }
    }

    Ok(())
}

fn run_mesh_command(home: &std::path::Path, command: MeshCommand) -> anyhow::Result<()> {
    match command {
        MeshCommand::Create { name } => {
            let mut node_config = NodeConfig::load_or_default(&config::node_config_path(home))?;
            node_config.mesh_name = Some(name.clone());
            node_config.save(&config::node_config_path(home))?;
            let node = open_node(home)?;
            println!("founded mesh '{name}' as node {}", node.local_node_id());
        }
        MeshCommand::Join { token_json } => {
            let token: atmosphere_core::Token = serde_json::from_str(&token_json)?;
            let node = open_node(home)?;
            atmosphere::identity::verify_token(&token, &node.identity.verifying_key(), &node.revoked_tokens.read())?;
            let mut node_config = NodeConfig::load_or_default(&config::node_config_path(home))?;
            node_config.mesh_name = Some(token.mesh_name.clone());
            node_config.save(&config::node_config_path(home))?;
            println!("accepted invitation to mesh '{}' from {}", token.mesh_name, token.issuer_node_id);
        }
        MeshCommand::Invite { mesh_id, mesh_name, endpoint, ttl_secs } => {
            let node = open_node(home)?;
            let endpoints = JoinEndpoints {
                local: endpoint.first().cloned(),
                public: endpoint.get(1).cloned(),
                relay: endpoint.get(2).cloned(),
            };
            let token = node.issue_join_token(&mesh_id, &mesh_name, vec!["*".to_string()], ttl_secs, endpoints)?;
            println!("{}", serde_json::to_string_pretty(&token)?);
        }
        MeshCommand::Peers => {
            let node = open_node(home)?;
            let mut seen = std::collections::HashSet::new();
            for cap in node.registry.all_online() {
                if cap.node_id != node.local_node_id() && seen.insert(cap.node_id.clone()) {
                    println!("{}", cap.node_id);
                }
            }
        }
        MeshCommand::Status => {
            let node = open_node(home)?;
            println!(
                "node_id={} role={:?} mesh={:?} capabilities={}",
                node.local_node_id(),
                node.identity.role,
                node.node_config.mesh_name,
                node.registry.len()
            );
        }
    }
    Ok(())
}

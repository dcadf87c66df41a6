// ============================================
// File: crates/meshrelay-agent/src/main.rs
// ============================================
//! # MeshRelay Agent Entry Point
//!
//! ## Creation Reason
//! Main entry point for the MeshRelay agent binary.
//! Handles CLI parsing, logging setup, identity and agent startup.
//!
//! ## Main Functionality
//! - CLI argument parsing with clap
//! - Logging initialization with tracing (text or JSON)
//! - Configuration loading
//! - Agent identity load / generation
//! - Agent execution
//!
//! ## Usage
//! ```bash
//! # Write a starter configuration
//! meshrelay-agent init-config --output /etc/meshrelay/agent.toml
//!
//! # Start the agent
//! meshrelay-agent start
//!
//! # Other commands
//! meshrelay-agent validate            # Validate config file
//! meshrelay-agent id                  # Show this agent's id
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The identity file is created on first start; keep it across upgrades
//!   or neighbors will see a new agent
//! - `RUST_LOG` overrides the configured log level
//!
//! ## Last Modified
//! v0.1.0 - Initial CLI implementation

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshrelay_agent::{identity, Agent, AgentConfig};

// ============================================
// CLI Definition
// ============================================

/// MeshRelay mesh tunneling agent
///
/// Quick Start:
///   1. Run: meshrelay-agent init-config --output agent.toml
///   2. Add peers and exit prefixes to agent.toml
///   3. Run: meshrelay-agent start --config agent.toml
#[derive(Parser, Debug)]
#[command(name = "meshrelay-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the agent
    Start {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/meshrelay/agent.toml")]
        config: PathBuf,
    },

    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/meshrelay/agent.toml")]
        config: PathBuf,
    },

    /// Show this agent's id
    Id {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/meshrelay/agent.toml")]
        config: PathBuf,
    },

    /// Print or write a default configuration
    InitConfig {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// ============================================
// Main
// ============================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging("info", false);

    let result = match cli.command {
        Commands::Start { config } => cmd_start(&config).await,
        Commands::Validate { config } => cmd_validate(&config).await,
        Commands::Id { config } => cmd_id(&config).await,
        Commands::InitConfig { output } => cmd_init_config(output).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

// ============================================
// Commands
// ============================================

/// Starts the agent.
async fn cmd_start(config_path: &Path) -> anyhow::Result<()> {
    let config = if config_path.exists() {
        AgentConfig::load(config_path).await?
    } else {
        info!("Config file not found, using defaults");
        AgentConfig::default()
    };

    // Re-initialize logging with config level
    init_logging(&config.logging.level, config.logging.json);

    let id = identity::load_or_create(&config.agent.id_file).await?;

    info!("════════════════════════════════════════");
    info!("Agent ID:   {}", id);
    info!("Name:       {}", config.agent.display_name);
    info!("Exits:      {}", config.exit.prefixes.len());
    info!("Peers:      {}", config.peers.connect.len());
    info!("════════════════════════════════════════");

    let agent = Agent::with_tcp(config, id)?;
    agent.run().await?;

    Ok(())
}

/// Validates configuration file.
async fn cmd_validate(config_path: &Path) -> anyhow::Result<()> {
    if !config_path.exists() {
        println!("⚠️  Config file not found: {}", config_path.display());
        println!("   Agent will use default values.");
        return Ok(());
    }

    let config = AgentConfig::load(config_path).await?;

    println!("✅ Configuration is valid");
    println!();
    println!("Peers:");
    match config.peers.listen_addr {
        Some(addr) => println!("   Listen:     {addr}"),
        None => println!("   Listen:     (disabled)"),
    }
    for addr in &config.peers.connect {
        println!("   Connect:    {addr}");
    }
    println!();
    println!("Exit:");
    if config.exit.prefixes.is_empty() {
        println!("   (transit only)");
    }
    for prefix in &config.exit.prefixes {
        println!("   Prefix:     {prefix}");
    }
    println!();
    println!("Routing:");
    println!("   Advertise:  {}s", config.routing.advertise_interval_secs);
    println!("   Route TTL:  {}s", config.routing.route_ttl_secs);
    println!("   Max Hops:   {}", config.routing.max_hops);
    println!();
    println!("Limits:");
    println!("   Streams:       {}", config.limits.max_streams_total);
    println!("   Per Peer:      {}", config.limits.max_streams_per_peer);
    println!("   Associations:  {}", config.limits.max_associations);
    if !config.ingress.forwards.is_empty() {
        println!();
        println!("Forwards:");
        for forward in &config.ingress.forwards {
            println!("   {} → {}", forward.listen, forward.target);
        }
    }
    println!();

    Ok(())
}

/// Shows the persisted agent id.
async fn cmd_id(config_path: &Path) -> anyhow::Result<()> {
    let config = load_or_default_config(config_path).await;
    let id = identity::load(&config.agent.id_file).await?;
    println!("{id}");
    Ok(())
}

/// Prints or writes the default configuration.
async fn cmd_init_config(output: Option<PathBuf>) -> anyhow::Result<()> {
    let content = AgentConfig::default().to_toml();
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
            println!("✅ Wrote default configuration to {}", path.display());
        }
        None => print!("{content}"),
    }
    Ok(())
}

// ============================================
// Helper Functions
// ============================================

/// Initializes the tracing subscriber.
fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .try_init()
            .ok();
    }
}

/// Loads config or returns default.
async fn load_or_default_config(path: &Path) -> AgentConfig {
    if path.exists() {
        AgentConfig::load(path).await.unwrap_or_default()
    } else {
        AgentConfig::default()
    }
}

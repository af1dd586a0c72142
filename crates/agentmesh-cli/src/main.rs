// Copyright 2025 agentmesh Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # agentmesh CLI Entry Point
//!
//! Runs the agentmesh router against a fleet file over plain TCP.
//!
//! ## Usage
//!
//! ```bash
//! # Register the fleet, pre-warm connections and keep health-checking until Ctrl-C
//! agentmesh serve -c fleet.json
//!
//! # Pick the best agent for a set of capabilities (outputs raw JSON)
//! agentmesh resolve -c fleet.json -r git -r http
//!
//! # Connect the fleet once and print router statistics (outputs raw JSON)
//! agentmesh stats -c fleet.json
//! ```
//!
//! ## Fleet File
//!
//! ```json
//! {
//!   "router": { "max_agents": 5000, "top_k": 2, "strategy": "least_connections" },
//!   "agents": [
//!     {
//!       "id": "builder-1",
//!       "capabilities": [{ "name": "git", "version": "2.43" }],
//!       "connection": { "endpoint": "10.0.0.5:7000", "protocol": "rpc", "max_pool_size": 8 }
//!     }
//!   ]
//! }
//! ```
//!
//! `AGENTMESH_*` environment variables override the file; command-line flags
//! override both.

use agentmesh_common::{ConnectorSet, FleetFile, RouterConfig, Strategy, TcpConnector};
use agentmesh_router::Router;
use anyhow::{Context, Result};
use argh::FromArgs;
use std::sync::Arc;
use std::time::Duration;

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// agentmesh - capability-indexed agent router
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available CLI subcommands.
///
/// - **Serve**: long-running router with health sweeps
/// - **Resolve**: one routing decision, JSON on stdout
/// - **Stats**: one statistics snapshot, JSON on stdout
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Resolve(ResolveArgs),
    Stats(StatsArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run the router until interrupted
struct ServeArgs {
    /// path to the JSON fleet file
    #[argh(option, short = 'c')]
    config: String,

    /// load-balancing strategy: round-robin, least-connections or random
    #[argh(option, short = 's')]
    strategy: Option<Strategy>,

    /// seconds between statistics log lines
    #[argh(option, long = "stats-interval", default = "30")]
    stats_interval_secs: u64,

    /// skip pre-warming connections at startup
    #[argh(switch, long = "no-connect")]
    no_connect: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "resolve")]
/// resolve the best agent for a capability set
struct ResolveArgs {
    /// path to the JSON fleet file
    #[argh(option, short = 'c')]
    config: String,

    /// required capability, may be repeated
    #[argh(option, short = 'r', long = "require")]
    required: Vec<String>,

    /// give up after this many milliseconds
    #[argh(option, long = "timeout-ms", default = "5000")]
    timeout_ms: u64,

    /// load-balancing strategy: round-robin, least-connections or random
    #[argh(option, short = 's')]
    strategy: Option<Strategy>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "stats")]
/// print router statistics for a fleet
struct StatsArgs {
    /// path to the JSON fleet file
    #[argh(option, short = 'c')]
    config: String,

    /// run one health sweep before printing
    #[argh(switch, long = "probe")]
    probe: bool,

    /// skip pre-warming connections
    #[argh(switch, long = "no-connect")]
    no_connect: bool,
}

/// File, then environment, then command-line flags.
fn load_fleet(path: &str, strategy: Option<Strategy>) -> Result<FleetFile> {
    let mut fleet =
        FleetFile::load(path).with_context(|| format!("failed to load fleet file {}", path))?;
    fleet
        .router
        .apply_env_overrides()
        .context("invalid AGENTMESH_* override")?;
    if let Some(strategy) = strategy {
        fleet.router.strategy = strategy;
    }
    Ok(fleet)
}

/// Builds a TCP-backed router and registers every agent of the fleet.
fn build_router(fleet: FleetFile) -> Result<Router> {
    let FleetFile { router: config, agents } = fleet;
    let router = new_router(config)?;
    let total = agents.len();
    for agent in agents {
        let id = agent.id.clone();
        router
            .register(agent)
            .with_context(|| format!("failed to register agent {}", id))?;
    }
    tracing::info!("Registered {} agents", total);
    Ok(router)
}

fn new_router(config: RouterConfig) -> Result<Router> {
    let connectors = ConnectorSet::uniform(Arc::new(TcpConnector::new()));
    Ok(Router::new(config, connectors)?)
}

fn log_stats(router: &Router) {
    let stats = router.stats();
    tracing::info!(
        agents = stats.total_agents,
        healthy = stats.healthy_agents,
        degraded = stats.status_counts.degraded,
        unhealthy = stats.status_counts.unhealthy,
        connections = stats.active_connections,
        failed_connections = stats.failed_connections,
        "Router stats"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Initialize tracing only for serve
    // - resolve / stats: keep stdout clean JSON for piping to jq
    if matches!(cli.command, Commands::Serve(_)) {
        // Set default log level to INFO, but allow RUST_LOG env var to override
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Resolve(args) => resolve(args).await,
        Commands::Stats(args) => stats(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    tracing::info!("Loading fleet from {}", args.config);
    let fleet = load_fleet(&args.config, args.strategy)?;
    let router = build_router(fleet)?;

    router.start();
    if !args.no_connect {
        let report = router.mass_connect().await;
        tracing::info!(
            "Pre-warmed {}/{} agents ({} failed)",
            report.connected,
            report.attempted,
            report.failed
        );
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(&router),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    tracing::info!("Shutting down");
    router.shutdown().await;
    Ok(())
}

async fn resolve(args: ResolveArgs) -> Result<()> {
    let fleet = load_fleet(&args.config, args.strategy)?;
    let router = build_router(fleet)?;

    let handle = router
        .resolve_within(&args.required, Duration::from_millis(args.timeout_ms))
        .await?;

    let endpoint = router
        .agent(handle.agent_id())
        .map(|entry| entry.descriptor.connection.endpoint.clone());
    let output = serde_json::json!({
        "agent_id": handle.agent_id(),
        "endpoint": endpoint,
        "protocol": handle.protocol(),
        "connection_id": handle.id(),
    });

    router.release(handle).await;
    router.shutdown().await;

    // Output raw JSON to stdout
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

async fn stats(args: StatsArgs) -> Result<()> {
    let fleet = load_fleet(&args.config, None)?;
    let router = build_router(fleet)?;

    if !args.no_connect {
        router.mass_connect().await;
    }
    if args.probe {
        router.sweep_health().await;
    }

    let stats = router.stats();
    router.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// CLI argument parsing tests.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve() {
        let args: Cli = Cli::from_args(&["agentmesh"], &["serve", "-c", "fleet.json"]).unwrap();
        match args.command {
            Commands::Serve(ServeArgs {
                config,
                strategy,
                stats_interval_secs,
                no_connect,
            }) => {
                assert_eq!(config, "fleet.json");
                assert_eq!(strategy, None);
                assert_eq!(stats_interval_secs, 30);
                assert!(!no_connect);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_with_strategy() {
        let args: Cli = Cli::from_args(
            &["agentmesh"],
            &["serve", "-c", "f.json", "-s", "least-connections", "--no-connect"],
        )
        .unwrap();
        match args.command {
            Commands::Serve(ServeArgs {
                strategy,
                no_connect,
                ..
            }) => {
                assert_eq!(strategy, Some(Strategy::LeastConnections));
                assert!(no_connect);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_resolve_multiple_capabilities() {
        let args: Cli = Cli::from_args(
            &["agentmesh"],
            &["resolve", "-c", "f.json", "-r", "git", "--require", "http"],
        )
        .unwrap();
        match args.command {
            Commands::Resolve(ResolveArgs {
                required,
                timeout_ms,
                ..
            }) => {
                assert_eq!(required, vec!["git".to_string(), "http".to_string()]);
                assert_eq!(timeout_ms, 5000);
            }
            _ => panic!("Expected Resolve command"),
        }
    }

    #[test]
    fn test_cli_parse_stats() {
        let args: Cli =
            Cli::from_args(&["agentmesh"], &["stats", "-c", "f.json", "--probe"]).unwrap();
        match args.command {
            Commands::Stats(StatsArgs {
                probe, no_connect, ..
            }) => {
                assert!(probe);
                assert!(!no_connect);
            }
            _ => panic!("Expected Stats command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_strategy() {
        let result = Cli::from_args(&["agentmesh"], &["serve", "-c", "f.json", "-s", "fastest"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_requires_config() {
        assert!(Cli::from_args(&["agentmesh"], &["resolve", "-r", "git"]).is_err());
    }

    #[test]
    fn test_load_fleet_applies_strategy_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        std::fs::write(
            &path,
            r#"{
                "router": {"strategy": "random"},
                "agents": [{"id": "a1", "connection": {"endpoint": "127.0.0.1:1", "protocol": "rpc"}}]
            }"#,
        )
        .unwrap();
        let path = path.to_str().unwrap();

        assert_eq!(load_fleet(path, None).unwrap().router.strategy, Strategy::Random);
        let fleet = load_fleet(path, Some(Strategy::RoundRobin)).unwrap();
        assert_eq!(fleet.router.strategy, Strategy::RoundRobin);
        assert_eq!(fleet.agents.len(), 1);
    }

    #[test]
    fn test_load_fleet_reports_missing_file() {
        let err = load_fleet("/nonexistent/fleet.json", None).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fleet.json"));
    }

    #[tokio::test]
    async fn test_build_router_registers_fleet() {
        let fleet = FleetFile::from_json_str(
            r#"{"agents": [
                {"id": "a1", "capabilities": [{"name": "git", "version": "1"}],
                 "connection": {"endpoint": "127.0.0.1:1", "protocol": "rpc"}},
                {"id": "a2", "connection": {"endpoint": "127.0.0.1:2", "protocol": "http"}}
            ]}"#,
        )
        .unwrap();

        let router = build_router(fleet).unwrap();
        let stats = router.stats();
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.capability_coverage.get("git"), Some(&1));
        router.shutdown().await;
    }
}

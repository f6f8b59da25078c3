//! splitbrain - inspect resolver configuration and replay partition scenarios

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use serde::Deserialize;
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;

use splitbrain::{decide, ClusterNode, MembershipView, NodeAddress, NodeStatus, SplitBrainConfig, StrategyDecision};

#[derive(Parser)]
#[command(
    name = "splitbrain",
    version,
    about = "Split-brain resolver tooling",
    long_about = "Validates split-brain resolver configuration and evaluates the decision \
                  a configured strategy takes for a given partition scenario."
)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the effective strategy
    CheckConfig {
        /// TOML configuration file
        file: PathBuf,
    },

    /// Evaluate the decision for a partition scenario
    Decide {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// JSON scenario file
        #[arg(short, long)]
        scenario: PathBuf,
    },
}

/// Partition as seen by one node
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Scenario {
    #[serde(default = "default_version")]
    version: u64,
    nodes: Vec<ScenarioNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ScenarioNode {
    address: String,
    #[serde(default)]
    roles: BTreeSet<String>,
    joined_at: u64,
    #[serde(default = "default_reachable")]
    reachable: bool,
}

fn default_version() -> u64 {
    1
}

fn default_reachable() -> bool {
    true
}

impl Scenario {
    fn view(&self) -> Result<MembershipView> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let address = NodeAddress::new(node.address.as_str())
                .with_context(|| format!("invalid node address '{}'", node.address))?;
            let status = if node.reachable {
                NodeStatus::Up
            } else {
                NodeStatus::Unreachable
            };
            nodes.push(
                ClusterNode::new(address, node.joined_at)
                    .with_roles(node.roles.iter().cloned())
                    .with_status(status),
            );
        }
        Ok(MembershipView::new(self.version, nodes))
    }
}

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let level = if cli.verbose { LevelFilter::DEBUG } else { LevelFilter::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::CheckConfig { file } => check_config(&file),
        Commands::Decide { config, scenario } => run_decide(&config, &scenario),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".bright_red().bold(), e);
        process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<SplitBrainConfig> {
    SplitBrainConfig::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let strategy = config.strategy()?;

    println!("{} {}", "✓".bright_green().bold(), path.display());
    println!("  {:<24} {}", "strategy".bright_cyan(), strategy);
    println!("  {:<24} {:?}", "stable-after".bright_cyan(), config.stable_after);
    match config.down_all_when_unstable {
        Some(extra) => println!("  {:<24} {:?}", "down-all-when-unstable".bright_cyan(), extra),
        None => println!("  {:<24} {}", "down-all-when-unstable".bright_cyan(), "off".dimmed()),
    }
    println!(
        "  {:<24} {}",
        "role".bright_cyan(),
        config.role.as_deref().unwrap_or("(all nodes)")
    );
    println!(
        "  {:<24} {} attempts, {:?} .. {:?}",
        "downing".bright_cyan(),
        config.downing.max_attempts,
        config.downing.initial_backoff,
        config.downing.max_backoff
    );
    Ok(())
}

fn run_decide(config_path: &Path, scenario_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let strategy = config.strategy()?;

    let source = std::fs::read_to_string(scenario_path)
        .with_context(|| format!("failed to read {}", scenario_path.display()))?;
    let scenario: Scenario = serde_json::from_str(&source)
        .with_context(|| format!("failed to parse {}", scenario_path.display()))?;
    let observation = scenario.view()?.observe();
    debug!(
        version = observation.version,
        reachable = observation.reachable.len(),
        unreachable = observation.unreachable.len(),
        "scenario loaded"
    );

    let decision = decide(&strategy, &observation, &config.role_filter());
    print_decision(&decision, &observation.all_nodes().map(|n| n.address.clone()).collect());
    Ok(())
}

fn print_decision(decision: &StrategyDecision, nodes: &BTreeSet<NodeAddress>) {
    let reason = format!("{:?}", decision.reason);
    let reason = if decision.reason.is_safe_default() {
        reason.bright_red().bold()
    } else {
        reason.bright_green()
    };
    println!("{} {} (version {})", "Strategy:".bold(), decision.strategy, decision.version);
    println!("{} {}", "Reason:".bold(), reason);
    for address in nodes {
        if decision.downs(address) {
            println!("  {} {}", "down".bright_red(), address);
        } else {
            println!("  {} {}", "keep".bright_green(), address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_builds_partitioned_view() {
        let scenario: Scenario = serde_json::from_str(
            r#"{"nodes": [
                {"address": "a:1", "joined-at": 1, "roles": ["backend"]},
                {"address": "b:1", "joined-at": 2, "reachable": false}
            ]}"#,
        )
        .unwrap();
        let observation = scenario.view().unwrap().observe();
        assert_eq!(observation.version, 1);
        assert_eq!(observation.reachable.len(), 1);
        assert_eq!(observation.unreachable.len(), 1);
    }

    #[test]
    fn test_scenario_rejects_bad_address() {
        let scenario: Scenario =
            serde_json::from_str(r#"{"nodes": [{"address": "nohost", "joined-at": 1}]}"#).unwrap();
        assert!(scenario.view().is_err());
    }
}

//! CLI interface for agent-improve

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ImproverConfig;
use crate::improvement::{Applier, CooldownGate};
use crate::metrics::{AgentStats, GlobalStats, ImprovementStats, StatsAggregator};
use crate::store::Stores;
use crate::types::AppliedImprovementRecord;

#[derive(Parser)]
#[command(name = "agent-improve")]
#[command(about = "Inspect and operate the agent self-improvement loop", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding traces, fix history and cooldowns
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show improvement statistics
    Stats {
        /// Limit to one agent
        #[arg(short, long)]
        agent: Option<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List applied improvements from the fix history
    History {
        /// Limit to one agent
        #[arg(short, long)]
        agent: Option<String>,
        /// Maximum records to show, newest first
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Re-apply the pre-change configuration of a resolved improvement
    Rollback {
        /// Improvement record ID
        id: String,
    },
    /// Print the effective configuration
    Config,
}

fn load_config(cli: &Cli) -> Result<ImproverConfig> {
    let mut config = ImproverConfig::load_or_default(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let dir = config.data_dir();
    let stores = Stores::file_backed(&dir);

    match cli.command {
        Commands::Stats { agent, json } => {
            let gate = CooldownGate::open(dir.join("cooldowns.json"), config.cooldown_hours).await?;
            let stats = StatsAggregator::new(
                stores.trace.clone(),
                stores.history.clone(),
                Arc::new(gate),
                config.analysis_window(),
            );
            let summary = stats.get_stats(agent.as_deref(), Utc::now()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                match summary {
                    ImprovementStats::Agent(s) => print_agent_stats(&s),
                    ImprovementStats::Global(s) => print_global_stats(&s),
                }
            }
        }
        Commands::History { agent, limit } => {
            let applier = Applier::new(stores.configs.clone(), stores.history.clone());
            let mut records = applier.history(agent.as_deref()).await?;
            if records.is_empty() {
                println!("No improvements recorded.");
                return Ok(());
            }
            records.sort_by(|a, b| b.applied_at.cmp(&a.applied_at));
            for record in records.iter().take(limit) {
                print_record(record);
            }
        }
        Commands::Rollback { id } => {
            let applier = Applier::new(stores.configs.clone(), stores.history.clone());
            let record = applier
                .replay_rollback(&id)
                .await
                .with_context(|| format!("Failed to roll back improvement {}", id))?;
            println!(
                "Restored configuration of agent {} from before improvement {} ({}).",
                record.agent_id, record.id, record.candidate.kind
            );
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            println!("# data dir: {}", dir.display());
        }
    }

    Ok(())
}

fn print_agent_stats(s: &AgentStats) {
    println!("Agent: {}", s.agent_id);
    println!("  Executions (window): {} ({} ok, {} failed)", s.total, s.completed, s.failed);
    println!("  Success rate:        {:.1}%", s.success_rate * 100.0);
    match s.last_improvement_at {
        Some(at) => println!("  Last improvement:    {}", at.to_rfc3339()),
        None => println!("  Last improvement:    never"),
    }
    let remaining = s.remaining_cooldown_secs(Utc::now());
    if remaining > 0 {
        println!(
            "  Cooldown:            {}h {}m remaining",
            remaining / 3600,
            (remaining % 3600) / 60
        );
    } else {
        println!("  Cooldown:            none");
    }
    if let Some(id) = &s.pending_validation {
        println!("  Validating:          {}", id);
    }
    println!(
        "  Improvements:        {} committed, {} rolled back, {} pending, {} failed to apply",
        s.improvements.committed,
        s.improvements.rolled_back,
        s.improvements.pending_validation,
        s.improvements.apply_failed
    );
}

fn print_global_stats(s: &GlobalStats) {
    println!("Agents observed:       {}", s.total_agents);
    println!("Executions recorded:   {}", s.total_executions);
    println!("Committed improvements: {}", s.total_committed);
    println!("Rolled back:           {}", s.improvements.rolled_back);
    if s.agents_with_committed.is_empty() {
        println!("No agent has a committed improvement yet.");
    } else {
        println!("Agents improved:       {}", s.agents_with_committed.join(", "));
    }
}

fn print_record(record: &AppliedImprovementRecord) {
    let resolution = record
        .resolution
        .map(|r| format!(" ({})", r))
        .unwrap_or_default();
    println!(
        "{}  {}  {}  {}{}",
        record.applied_at.format("%Y-%m-%d %H:%M"),
        record.agent_id,
        record.candidate.kind,
        record.status,
        resolution
    );
    println!("    id: {}", record.id);
    println!("    {}", record.candidate.rationale);
    if let (Some(b), Some(t)) = (&record.baseline_stats, &record.treatment_stats) {
        println!(
            "    baseline {:.0}% / {:.0}ms -> treatment {:.0}% / {:.0}ms",
            b.success_rate * 100.0,
            b.mean_duration_ms,
            t.success_rate * 100.0,
            t.mean_duration_ms
        );
    }
    if let Some(failure) = &record.failure {
        println!("    failure: {}", failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["agent-improve", "stats", "--agent", "coder-001", "--data-dir", "/tmp/x"]).unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(cli.command, Commands::Stats { agent: Some(ref a), json: false } if a == "coder-001"));
    }

    #[test]
    fn test_rollback_requires_id() {
        assert!(Cli::try_parse_from(["agent-improve", "rollback"]).is_err());
    }
}

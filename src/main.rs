#![allow(dead_code)]

mod classify;
mod client;
mod config;
mod db;
mod eligibility;
mod model;
mod opener;
mod planner;
mod store;

use crate::client::{LndRestClient, NodeClient};
use crate::db::Database;
use crate::eligibility::is_eligible;
use crate::model::{ChannelCandidate, OpenPlan, SOURCE_MANUAL};
use crate::opener::{ExecuteOptions, ExecutionEngine};
use crate::planner::create_plan;
use crate::store::{CandidateStore, HistoryStore};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::Config;
use log::{error, info, warn};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ln-herder", about = "Batch channel opener for an LND node")]
struct Cli {
    /// Path to lnherder.toml config file
    #[arg(short, long, default_value = "lnherder.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute and print an open plan without executing anything
    Plan,
    /// Compute an open plan and execute it against the node
    Open {
        /// Plan and print but execute nothing (overrides config)
        #[arg(long)]
        dry_run: bool,
        /// Funding fee rate in sat/vB (overrides config)
        #[arg(long)]
        fee_rate: Option<u64>,
    },
    /// List stored candidates
    Candidates,
    /// Pin a candidate manually; manual candidates outrank all others
    Add { pubkey: String },
    /// Print past batch executions
    History,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = config.general.log_level.clone();
    env_logger::Builder::new()
        .filter_level(log_level.parse().unwrap_or(log::LevelFilter::Info))
        .format_timestamp_secs()
        .init();

    info!("ln-herder v{} starting", env!("CARGO_PKG_VERSION"));

    let db = Database::open(&config.general.database_path)?;

    match cli.command {
        Commands::Plan => cmd_plan(&config, &db).await,
        Commands::Open { dry_run, fee_rate } => cmd_open(&config, &db, dry_run, fee_rate).await,
        Commands::Candidates => cmd_candidates(&db),
        Commands::Add { pubkey } => cmd_add(&db, pubkey),
        Commands::History => cmd_history(&db),
    }
}

/// Build a plan from the candidate store and the node's current peer set.
async fn build_plan(
    config: &Config,
    client: &dyn NodeClient,
    db: &Database,
) -> anyhow::Result<OpenPlan> {
    let open_peers: HashSet<String> = client.get_open_channels().await?.into_iter().collect();
    let candidates = CandidateStore::new(db).load()?;
    info!(
        "Planning: {} candidates, {} existing peers, {} sat budget",
        candidates.len(),
        open_peers.len(),
        config.open.budget_sats
    );
    Ok(create_plan(
        config.open.budget_sats,
        config.open.default_channel_sats,
        config.open.max_channel_sats,
        &candidates,
        &open_peers,
        Utc::now(),
    ))
}

async fn cmd_plan(config: &Config, db: &Database) -> anyhow::Result<()> {
    let client = LndRestClient::new(config)?;
    let plan = build_plan(config, &client, db).await?;
    if plan.channels.is_empty() {
        println!("No eligible candidates within budget");
        return Ok(());
    }
    print_plan(&plan);
    Ok(())
}

async fn cmd_open(
    config: &Config,
    db: &Database,
    dry_run_flag: bool,
    fee_rate: Option<u64>,
) -> anyhow::Result<()> {
    let dry_run = dry_run_flag || config.general.dry_run;
    let fee_rate_sat_per_vb = fee_rate.unwrap_or(config.open.fee_rate_sat_per_vb);
    if dry_run {
        warn!("DRY-RUN MODE: no channels will be opened");
    }

    let client: Arc<dyn NodeClient> = Arc::new(LndRestClient::new(config)?);
    let plan = build_plan(config, client.as_ref(), db).await?;
    if plan.channels.is_empty() {
        info!("No eligible candidates within budget, nothing to do");
        return Ok(());
    }
    print_plan(&plan);

    let engine = ExecutionEngine::new(client, db);
    let outcome = engine
        .execute_plan(
            plan,
            &ExecuteOptions { fee_rate_sat_per_vb, dry_run },
        )
        .await?;

    for result in &outcome.results {
        if result.success {
            info!(
                "Opened channel to {} ({})",
                result.pubkey,
                result.channel_id.as_deref().unwrap_or("-")
            );
        } else {
            warn!(
                "Failed {}: {} ({})",
                result.pubkey,
                result
                    .rejection_reason
                    .map(|r| r.as_str())
                    .unwrap_or("unknown"),
                result.error.as_deref().unwrap_or("")
            );
        }
    }

    if let Some(fatal) = &outcome.fatal {
        error!("Batch aborted: {}", fatal);
        anyhow::bail!("batch open failed: {}", fatal);
    }
    Ok(())
}

fn cmd_candidates(db: &Database) -> anyhow::Result<()> {
    let candidates = CandidateStore::new(db).load()?;
    if candidates.is_empty() {
        println!("No candidates stored");
        return Ok(());
    }

    let now = Utc::now();
    let no_peers = HashSet::new();
    println!(
        "{:<66} {:>8} {:>14} {:>10} {:>8}  {}",
        "pubkey", "channels", "capacity", "rejections", "eligible", "sources"
    );
    for c in &candidates {
        println!(
            "{:<66} {:>8} {:>14} {:>10} {:>8}  {}",
            c.pubkey,
            c.channels,
            c.capacity_sats,
            c.rejections.len(),
            if is_eligible(c, &no_peers, now) { "yes" } else { "no" },
            c.sources.iter().cloned().collect::<Vec<_>>().join(",")
        );
    }
    Ok(())
}

fn cmd_add(db: &Database, pubkey: String) -> anyhow::Result<()> {
    let pubkey = pubkey.to_ascii_lowercase();
    if !is_valid_pubkey(&pubkey) {
        anyhow::bail!("not a valid compressed node pubkey: {}", pubkey);
    }

    // Merge into an existing record so graph-derived fields survive.
    let store = CandidateStore::new(db);
    let mut candidate = store
        .get(&pubkey)?
        .unwrap_or_else(|| ChannelCandidate::new(&pubkey, SOURCE_MANUAL));
    candidate.sources.insert(SOURCE_MANUAL.to_string());
    store.upsert(&candidate)?;

    println!("Pinned {} as a manual candidate", pubkey);
    Ok(())
}

fn cmd_history(db: &Database) -> anyhow::Result<()> {
    let records = HistoryStore::new(db).load()?;
    if records.is_empty() {
        println!("No batch executions recorded");
        return Ok(());
    }
    for record in &records {
        let opened = record.results.iter().filter(|r| r.success).count();
        let failed = record.results.len() - opened;
        println!(
            "{}  planned {:>2}  opened {:>2}  failed {:>2}  budget {} sat",
            record.date.format("%Y-%m-%d %H:%M:%S"),
            record.plan.channels.len(),
            opened,
            failed,
            record.plan.budget_sats
        );
    }
    Ok(())
}

fn print_plan(plan: &OpenPlan) {
    println!(
        "Open plan: {} channels, {} sat committed, {} sat remaining of {} sat budget",
        plan.channels.len(),
        plan.total_amount_sats,
        plan.remaining_budget_sats,
        plan.budget_sats
    );
    for (i, channel) in plan.channels.iter().enumerate() {
        println!(
            "  {:>2}. {}  {:>10} sat{}{}",
            i + 1,
            channel.pubkey,
            channel.amount_sats,
            if channel.alias.is_empty() {
                String::new()
            } else {
                format!("  ({})", channel.alias)
            },
            if channel.minimum_enforced {
                "  [minimum enforced]"
            } else {
                ""
            }
        );
    }
}

fn is_valid_pubkey(s: &str) -> bool {
    s.len() == 66
        && (s.starts_with("02") || s.starts_with("03"))
        && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::client::mock::MockNodeClient;
    use chrono::Duration;

    fn pk(n: u8) -> String {
        format!("02{:064x}", n)
    }

    fn test_config() -> Config {
        Config::test_default(std::path::PathBuf::from("/dev/null"))
    }

    fn seed(db: &Database, n: u8) {
        let store = CandidateStore::new(db);
        for i in 1..=n {
            let mut c = ChannelCandidate::new(pk(i), "graph");
            c.added_at = Utc::now() - Duration::days(i as i64);
            store.upsert(&c).unwrap();
        }
    }

    #[tokio::test]
    async fn test_build_plan_excludes_existing_peers() {
        let config = test_config();
        let db = Database::open_in_memory().unwrap();
        seed(&db, 2);

        let mut mock = MockNodeClient::new();
        mock.open_channels = vec![pk(1)];

        let plan = build_plan(&config, &mock, &db).await.unwrap();
        assert_eq!(plan.channels.len(), 1);
        assert_eq!(plan.channels[0].pubkey, pk(2));
    }

    #[tokio::test]
    async fn test_full_pipeline_plan_and_open() {
        let config = test_config();
        let db = Database::open_in_memory().unwrap();
        seed(&db, 3);

        let mut mock = MockNodeClient::new();
        for i in 1..=3 {
            mock = mock.with_peer(&pk(i));
        }
        let client: Arc<dyn NodeClient> = Arc::new(mock);

        let plan = build_plan(&config, client.as_ref(), &db).await.unwrap();
        assert_eq!(plan.channels.len(), 3);

        let engine = ExecutionEngine::new(client, &db);
        let outcome = engine
            .execute_plan(plan, &ExecuteOptions { fee_rate_sat_per_vb: 2, dry_run: false })
            .await
            .unwrap();

        assert!(outcome.fatal.is_none());
        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results.iter().all(|r| r.success));
        assert_eq!(HistoryStore::new(&db).load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_candidate_ranks_first() {
        let config = test_config();
        let db = Database::open_in_memory().unwrap();
        let store = CandidateStore::new(&db);

        // Well-established graph candidate with earnings history
        let mut graph = ChannelCandidate::new(pk(1), "graph");
        graph.channels = 50;
        graph.capacity_sats = 100_000_000;
        graph.history.push(crate::model::ChannelLifecycle {
            channel_id: "old:0".to_string(),
            opened_at: Utc::now() - Duration::days(90),
            closed_at: Some(Utc::now() - Duration::days(30)),
            capacity_sats: 1_000_000,
            fees_earned_msat: 50_000,
        });
        store.upsert(&graph).unwrap();

        cmd_add(&db, pk(2)).unwrap();

        let plan = build_plan(&config, &MockNodeClient::new(), &db)
            .await
            .unwrap();
        assert_eq!(plan.channels[0].pubkey, pk(2));
        assert_eq!(plan.channels[1].pubkey, pk(1));
    }

    #[test]
    fn test_manual_add_merges_into_existing_record() {
        let db = Database::open_in_memory().unwrap();
        let store = CandidateStore::new(&db);

        let mut c = ChannelCandidate::new(pk(1), "graph");
        c.channels = 12;
        c.capacity_sats = 5_000_000;
        store.upsert(&c).unwrap();

        cmd_add(&db, pk(1)).unwrap();

        let merged = store.get(&pk(1)).unwrap().unwrap();
        assert!(merged.is_manual());
        assert!(merged.sources.contains("graph"));
        // Graph-derived fields survive the pin
        assert_eq!(merged.channels, 12);
        assert_eq!(merged.capacity_sats, 5_000_000);
    }

    #[test]
    fn test_pubkey_validation() {
        assert!(is_valid_pubkey(&pk(1)));
        assert!(is_valid_pubkey(&format!("03{:064x}", 1u8)));
        // wrong prefix
        assert!(!is_valid_pubkey(&format!("04{:064x}", 1u8)));
        // wrong length
        assert!(!is_valid_pubkey("02abcd"));
        // non-hex
        assert!(!is_valid_pubkey(&format!("02{:063x}g", 1u8)));
    }

    #[test]
    fn test_add_rejects_malformed_pubkey() {
        let db = Database::open_in_memory().unwrap();
        assert!(cmd_add(&db, "not-a-pubkey".to_string()).is_err());
        assert!(CandidateStore::new(&db).load().unwrap().is_empty());
    }
}

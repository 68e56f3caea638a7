//! `dealflow` command line: ledger verification, point-in-time
//! reconstruction, audit reports and a scripted demo.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use dealflow_catalog::{NewPipeline, NewStage};
use dealflow_core::{Dealflow, DealflowConfig, MoveStage};
use dealflow_ledger::{
    EntityType, HistoryEntry, HistoryLedger, HistoryQuery, LedgerAnalytics, ReconstructionEngine,
    SystemClock,
};
use dealflow_model::{Actor, DealStatus, NewDeal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    let ledger_arg = || {
        Arg::new("ledger")
            .required(true)
            .value_parser(value_parser!(PathBuf))
            .help("Ledger JSON export")
    };

    Command::new("dealflow")
        .version(dealflow_core::VERSION)
        .about("Deal pipeline engine and history ledger tools")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("verify")
                .about("Recompute every checksum in a ledger export")
                .arg(ledger_arg()),
        )
        .subcommand(
            Command::new("reconstruct")
                .about("Print an entity's state at a point in time")
                .arg(ledger_arg())
                .arg(
                    Arg::new("entity-type")
                        .long("entity-type")
                        .required(true)
                        .help("Entity type, e.g. deal, pipeline, stage"),
                )
                .arg(
                    Arg::new("entity-id")
                        .long("entity-id")
                        .required(true)
                        .help("Entity identifier"),
                )
                .arg(
                    Arg::new("at")
                        .long("at")
                        .value_parser(parse_instant)
                        .help("RFC 3339 instant; defaults to now"),
                ),
        )
        .subcommand(
            Command::new("audit")
                .about("Audit trail of one entity, or activity report for the whole ledger")
                .arg(ledger_arg())
                .arg(Arg::new("entity-type").long("entity-type").requires("entity-id"))
                .arg(Arg::new("entity-id").long("entity-id").requires("entity-type"))
                .arg(Arg::new("actor").long("actor").help("Only entries by this actor"))
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .default_value("20")
                        .value_parser(value_parser!(usize))
                        .help("Entries to list"),
                ),
        )
        .subcommand(
            Command::new("demo")
                .about("Run the Dealer/Integration walkthrough in memory")
                .arg(
                    Arg::new("export")
                        .long("export")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write the resulting ledger here"),
                ),
        )
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &ArgMatches) -> Result<DealflowConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => Ok(DealflowConfig::from_file(path)?),
        None => Ok(DealflowConfig::default()),
    }
}

fn load_ledger(path: &Path, config: &DealflowConfig) -> Result<Arc<HistoryLedger>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read ledger {}", path.display()))?;
    let ledger = HistoryLedger::import_json(&text, config.ledger.checksummer()?, Arc::new(SystemClock))
        .with_context(|| format!("failed to parse ledger {}", path.display()))?;
    tracing::info!(path = %path.display(), entries = ledger.len(), "Ledger loaded");
    Ok(Arc::new(ledger))
}

fn print_entry(entry: &HistoryEntry) {
    let fields = entry
        .changed_fields
        .as_ref()
        .map(|f| f.join(","))
        .unwrap_or_default();
    println!(
        "  #{:<5} {}  {:<7} {}:{}  by {}  [{}]",
        entry.sequence,
        entry.timestamp.to_rfc3339(),
        entry.operation,
        entry.entity_type,
        entry.entity_id,
        entry.actor_id,
        fields
    );
}

fn verify(args: &ArgMatches, config: &DealflowConfig) -> Result<ExitCode> {
    let path = args.get_one::<PathBuf>("ledger").context("ledger path missing")?;
    let ledger = load_ledger(path, config)?;
    let report = ledger.verify_integrity();

    println!("Checked {} entries", report.checked);
    if report.is_clean() {
        println!("Ledger intact");
        return Ok(ExitCode::SUCCESS);
    }
    for violation in &report.violations {
        println!(
            "  CORRUPTED #{} {} stored={} recomputed={}",
            violation.sequence, violation.entry_id, violation.stored, violation.recomputed
        );
    }
    println!("{} corrupted entries", report.violations.len());
    Ok(ExitCode::FAILURE)
}

fn reconstruct(args: &ArgMatches, config: &DealflowConfig) -> Result<ExitCode> {
    let path = args.get_one::<PathBuf>("ledger").context("ledger path missing")?;
    let entity_type = EntityType::from(
        args.get_one::<String>("entity-type")
            .context("entity type missing")?
            .as_str(),
    );
    let entity_id = args.get_one::<String>("entity-id").context("entity id missing")?;
    let at = args.get_one::<DateTime<Utc>>("at").copied().unwrap_or_else(Utc::now);

    let engine = ReconstructionEngine::new(load_ledger(path, config)?);
    match engine.state_at(&entity_type, entity_id, at) {
        Some(state) => {
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("{entity_type} {entity_id} did not exist at {}", at.to_rfc3339());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn audit(args: &ArgMatches, config: &DealflowConfig) -> Result<ExitCode> {
    let path = args.get_one::<PathBuf>("ledger").context("ledger path missing")?;
    let limit = args.get_one::<usize>("limit").copied().unwrap_or(20);
    let actor = args.get_one::<String>("actor");
    let ledger = load_ledger(path, config)?;

    if let (Some(entity_type), Some(entity_id)) = (
        args.get_one::<String>("entity-type"),
        args.get_one::<String>("entity-id"),
    ) {
        let entity_type = EntityType::from(entity_type.as_str());
        let summary = ledger.activity_summary(&entity_type, entity_id);
        println!("{entity_type} {entity_id}: {} operations", summary.total_operations);
        for (operation, count) in &summary.by_operation {
            println!("  {operation:<7} {count}");
        }
        if let (Some(by), Some(at)) = (&summary.last_changed_by, summary.last_changed_at) {
            println!("  last changed by {by} at {}", at.to_rfc3339());
        }
        let mut query = HistoryQuery::for_entity(entity_type, entity_id.clone()).limit(limit);
        if let Some(actor) = actor {
            query = query.by_actor(actor.clone());
        }
        println!("Trail (newest first):");
        for entry in ledger.get_history(&query) {
            print_entry(&entry);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut scope = HistoryQuery::new();
    if let Some(actor) = actor {
        scope = scope.by_actor(actor.clone());
    }
    let analytics = LedgerAnalytics::new(ledger.clone()).scoped(scope.clone());

    println!("Operations:");
    for (operation, count) in analytics.operation_breakdown() {
        println!("  {operation:<7} {count}");
    }
    println!("Entity types:");
    for (entity_type, count) in analytics.activity_by_entity_type() {
        println!("  {entity_type:<12} {count}");
    }
    println!("Top actors:");
    for (actor, count) in analytics.top_actors(5) {
        println!("  {actor:<20} {count}");
    }
    let stats = analytics.security_stats(&config.analytics);
    println!(
        "Security: {} deletes, {} restores, {} after hours, {} actors",
        stats.deletes, stats.restores, stats.after_hours_operations, stats.distinct_actors
    );
    let findings = analytics.detect_suspicious(&config.analytics);
    if !findings.is_empty() {
        println!("Findings:");
        for finding in findings.iter().take(limit) {
            println!("  {}", serde_json::to_string(finding)?);
        }
    }
    println!("Recent:");
    for entry in ledger.get_history(&scope.limit(limit)) {
        print_entry(&entry);
    }
    Ok(ExitCode::SUCCESS)
}

/// Dealer and Integration pipelines, one deal investigated and won
async fn run_demo(config: DealflowConfig) -> Result<Dealflow> {
    let app = Dealflow::in_memory(config, Arc::new(SystemClock))?;
    let actor = Actor::new("demo");
    let catalog = &app.catalog;

    let dealer = catalog
        .create_pipeline(NewPipeline::named("Dealer"), &actor)
        .await?;
    let investigation = catalog
        .create_stage(dealer.id, NewStage::named("Investigation").at(0), &actor)
        .await?;
    catalog
        .create_stage(dealer.id, NewStage::named("Lost").at(5).lost(), &actor)
        .await?;
    let won = catalog
        .create_stage(dealer.id, NewStage::named("Won").at(9).closing(), &actor)
        .await?;
    let integration = catalog
        .create_pipeline(NewPipeline::named("Integration"), &actor)
        .await?;
    catalog
        .create_stage(integration.id, NewStage::named("Start").at(0), &actor)
        .await?;

    let deal = app
        .machine
        .create_deal(NewDeal::titled("Northwind Motors"), &actor)
        .await?;
    app.machine
        .move_stage(deal.id, MoveStage::new(dealer.id, investigation.id), &actor)
        .await?;
    let deal = app
        .machine
        .move_stage(
            deal.id,
            MoveStage::new(dealer.id, won.id).with_note("Signed"),
            &actor,
        )
        .await?;
    if deal.status != DealStatus::Won {
        bail!("demo deal ended {} instead of WON", deal.status);
    }

    println!("Deal {} '{}' is {}", deal.id, deal.title, deal.status);
    for step in &deal.stage_history {
        println!(
            "  {} -> {} in {}{}",
            step.from_stage_id.map_or_else(|| "(none)".to_string(), |id| id.to_string()),
            step.to_stage_id,
            step.pipeline_id,
            if step.automatic { " (auto)" } else { "" }
        );
    }
    println!("Ledger holds {} entries", app.ledger.len());
    Ok(app)
}

fn demo(args: &ArgMatches, config: DealflowConfig) -> Result<ExitCode> {
    let runtime = tokio::runtime::Runtime::new()?;
    let app = runtime.block_on(run_demo(config))?;
    if let Some(path) = args.get_one::<PathBuf>("export") {
        std::fs::write(path, app.ledger.export_json()?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "Ledger exported");
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));
    let config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("verify", args)) => verify(args, &config),
        Some(("reconstruct", args)) => reconstruct(args, &config),
        Some(("audit", args)) => audit(args, &config),
        Some(("demo", args)) => demo(args, config),
        _ => Ok(ExitCode::SUCCESS),
    }
}

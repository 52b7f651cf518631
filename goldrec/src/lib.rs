//! Library module for the goldrec operator CLI.
//!
//! Argument parsing and command execution live here so they can be tested
//! without spawning the binary; `main.rs` only wires up logging and signals.

pub mod output;

use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use goldrec_core::{
    EntityStore, EntityType, GoldrecConfig, LogFormat, Pipeline, Result, ViolationStatus,
    ingest::{self, InputKind, SourceFile},
    models::ViolationKey,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default location of the durable entity store.
pub const DEFAULT_DATABASE: &str = "sqlite://goldrec.db";

/// CLI argument structure
#[derive(Debug, Parser)]
#[command(name = "goldrec")]
#[command(about = "Provider master-data pipeline: resolve, synthesize, validate, score")]
#[command(version)]
#[command(long_about = "
goldrec - provider master data

Resolves provider and facility captures from several source systems into
versioned golden records, evaluates data-quality rules and scores tables.

EXAMPLES:
  goldrec process --batch-id 2024-06-01 --input state_board:provider:board.jsonl
  goldrec evaluate
  goldrec score --batch-id 2024-06-01
  goldrec violation set --rule npi_format --entity-id prov:rec:claims:C-9 --status accepted-risk
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every command.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all output except errors")]
    pub quiet: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,

    /// Configuration file (JSON)
    #[arg(short, long, global = true, env = "GOLDREC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Entity store connection string
    #[arg(
        long,
        global = true,
        env = "GOLDREC_DATABASE",
        default_value = DEFAULT_DATABASE,
        help = "Entity store (sqlite:// URL, file path, or :memory:)"
    )]
    pub database: String,

    /// Write the JSON report to a file instead of stdout
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,
}

/// Log format as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest JSON Lines files as one change batch and apply it
    Process(ProcessArgs),
    /// Evaluate rules and reconcile stored violations
    Evaluate(EvaluateArgs),
    /// Score table quality for a batch
    Score(ScoreArgs),
    /// Show store row counts
    Status,
    /// List or update violations
    #[command(subcommand)]
    Violation(ViolationCommand),
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Batch identifier; re-running a completed batch is a no-op
    #[arg(long)]
    pub batch_id: String,

    /// Input file as SOURCE:KIND:PATH (kind is provider, facility or activity)
    #[arg(long = "input", required = true, value_parser = parse_source_file)]
    pub inputs: Vec<SourceFile>,
}

#[derive(Debug, Args)]
pub struct EvaluateArgs {
    /// Reference date for time-relative rules (defaults to today)
    #[arg(long)]
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Args)]
pub struct ScoreArgs {
    /// Batch the metrics are recorded against
    #[arg(long)]
    pub batch_id: String,
}

#[derive(Debug, Subcommand)]
pub enum ViolationCommand {
    /// List violations
    List {
        /// Include resolved and overridden violations
        #[arg(long)]
        all: bool,
    },
    /// Apply a steward decision to one violation
    Set(SetViolationArgs),
}

#[derive(Debug, Args)]
pub struct SetViolationArgs {
    #[arg(long)]
    pub rule: String,

    #[arg(long, value_parser = parse_entity_type, default_value = "provider")]
    pub entity_type: EntityType,

    #[arg(long)]
    pub entity_id: String,

    #[arg(long, value_enum)]
    pub status: StatusArg,

    /// Resolution note recorded with the change
    #[arg(long)]
    pub note: Option<String>,
}

/// Violation statuses a steward can set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Open,
    InProgress,
    Resolved,
    FalsePositive,
    AcceptedRisk,
}

impl From<StatusArg> for ViolationStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Open => ViolationStatus::Open,
            StatusArg::InProgress => ViolationStatus::InProgress,
            StatusArg::Resolved => ViolationStatus::Resolved,
            StatusArg::FalsePositive => ViolationStatus::FalsePositive,
            StatusArg::AcceptedRisk => ViolationStatus::AcceptedRisk,
        }
    }
}

fn parse_source_file(value: &str) -> std::result::Result<SourceFile, String> {
    value.parse::<SourceFile>().map_err(|e| e.to_string())
}

fn parse_entity_type(value: &str) -> std::result::Result<EntityType, String> {
    EntityType::parse(value).ok_or_else(|| format!("unknown entity type '{}'", value))
}

/// Report of the `process` command.
#[derive(Debug, Serialize)]
struct ProcessReport {
    ingestion: Vec<ingest::IngestReport>,
    batch: goldrec_core::BatchResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    activity: Option<goldrec_core::ActivityReport>,
}

/// Loads the configuration file, or defaults when none is given.
pub async fn load_config(path: Option<&Path>) -> Result<GoldrecConfig> {
    match path {
        Some(path) => GoldrecConfig::load(path).await,
        None => {
            tracing::debug!("No configuration file given, using defaults");
            Ok(GoldrecConfig::default())
        }
    }
}

/// Opens the entity store named by a connection string.
pub async fn open_store(database: &str) -> Result<Arc<dyn EntityStore>> {
    #[cfg(feature = "sqlite")]
    {
        let store = goldrec_core::SqliteStore::open(database).await?;
        tracing::info!(backend = store.backend(), "Opened entity store");
        Ok(Arc::new(store))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        tracing::warn!(
            database,
            "Built without the sqlite feature, using a transient in-memory store"
        );
        Ok(Arc::new(goldrec_core::MemoryStore::new()))
    }
}

/// Executes a parsed command and returns its JSON report.
///
/// # Errors
/// Returns configuration, I/O and store errors. Record-level failures during
/// processing are part of the report, not errors.
pub async fn execute(cli: &Cli, cancel: &CancellationToken) -> Result<String> {
    let config = load_config(cli.global.config.as_deref()).await?;
    let destination = cli.global.output.as_deref();

    match &cli.command {
        Command::Config => output::write_report(&config, destination).await,
        Command::Process(args) => {
            let pipeline = Pipeline::new(open_store(&cli.global.database).await?, config)?;
            let ingestion = ingest::read_batch(&args.batch_id, &args.inputs, Utc::now()).await?;
            let events: Vec<_> = ingestion
                .iter()
                .flat_map(|report| report.events.iter().cloned())
                .collect();
            let batch = pipeline
                .process_batch_with_cancel(&args.batch_id, &events, cancel)
                .await?;
            let activity_rows: Vec<_> = ingestion
                .iter()
                .flat_map(|report| report.activity.iter().cloned())
                .collect();
            let activity = if args.inputs.iter().any(|f| f.kind == InputKind::Activity) {
                Some(pipeline.record_activity(&activity_rows).await?)
            } else {
                None
            };
            let report = ProcessReport {
                ingestion,
                batch,
                activity,
            };
            output::write_report(&report, destination).await
        }
        Command::Evaluate(args) => {
            let mut pipeline = Pipeline::new(open_store(&cli.global.database).await?, config)?;
            if let Some(as_of) = args.as_of {
                pipeline = pipeline.with_as_of(as_of);
            }
            output::write_report(&pipeline.evaluate().await?, destination).await
        }
        Command::Score(args) => {
            let pipeline = Pipeline::new(open_store(&cli.global.database).await?, config)?;
            output::write_report(&pipeline.score(&args.batch_id).await?, destination).await
        }
        Command::Status => {
            let store = open_store(&cli.global.database).await?;
            output::write_report(&store.stats().await?, destination).await
        }
        Command::Violation(ViolationCommand::List { all }) => {
            let store = open_store(&cli.global.database).await?;
            let violations: Vec<_> = store
                .violations()
                .await?
                .into_iter()
                .filter(|v| *all || v.status.is_active())
                .collect();
            output::write_report(&violations, destination).await
        }
        Command::Violation(ViolationCommand::Set(args)) => {
            let store = open_store(&cli.global.database).await?;
            let key = ViolationKey {
                rule_name: args.rule.clone(),
                entity_type: args.entity_type,
                entity_id: args.entity_id.clone(),
            };
            let violation = store
                .set_violation_status(&key, args.status.into(), args.note.clone(), Utc::now())
                .await?;
            tracing::info!(
                rule = %key.rule_name,
                entity_id = %key.entity_id,
                status = %violation.status,
                "Violation status updated"
            );
            output::write_report(&violation, destination).await
        }
    }
}

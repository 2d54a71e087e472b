//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use loadctl_core::{ControlPlane, ExtractPlan};
use loadctl_shared::{
    AppConfig, ExecutionId, ExecutionRecord, LoadStrategy, NewRun, NewSource, RunFilter,
    RunOutcome, RunStatus, SourceConfig, SourceId, SourceType, TerminalStatus, Watermark,
    init_config, load_config, load_config_from,
};
use serde::Serialize;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// loadctl — source registry, watermarks, and run history for ETL pipelines.
#[derive(Parser)]
#[command(
    name = "loadctl",
    version,
    about = "Control-plane metadata for incremental ETL pipelines.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.loadctl/loadctl.toml).
    #[arg(long, global = true, env = "LOADCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Control database file, overriding the config file.
    #[arg(long, global = true, env = "LOADCTL_DB")]
    pub db: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Source registry operations.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Watermark checkpoint operations.
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
    },

    /// Execution log operations.
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Show whether the next extract for a source is full or incremental.
    Plan {
        /// Source id.
        source_id: SourceId,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Source registry subcommands.
#[derive(Subcommand)]
pub(crate) enum SourceAction {
    /// Register a new source and print its id.
    Register {
        #[arg(long)]
        name: String,

        /// file, api, or database.
        #[arg(long = "type")]
        source_type: SourceType,

        /// URI or path template to read from.
        #[arg(long)]
        location: String,

        /// Target table name.
        #[arg(long)]
        table: String,

        /// full or incremental.
        #[arg(long)]
        strategy: LoadStrategy,

        /// Column tracked by the watermark (required for incremental).
        #[arg(long)]
        merge_key: Option<String>,
    },
    /// List active sources, or one source by id.
    List {
        #[arg(long)]
        id: Option<SourceId>,

        /// Include deactivated sources.
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Deactivate a source (kept for history).
    Deactivate { id: SourceId },
    /// Reactivate a source.
    Activate { id: SourceId },
    /// Register the [[sources]] entries from the config file.
    Sync,
}

/// Watermark subcommands.
#[derive(Subcommand)]
pub(crate) enum WatermarkAction {
    /// Advance a watermark after a successful incremental load.
    Advance {
        source_id: SourceId,
        column: String,
        value: String,

        /// Only advance if the stored value still equals this.
        #[arg(long, conflicts_with = "expect_none")]
        expect: Option<String>,

        /// Only advance if no watermark exists yet.
        #[arg(long)]
        expect_none: bool,
    },
    /// Show one watermark.
    Get { source_id: SourceId, column: String },
    /// List all watermarks of a source.
    List { source_id: SourceId },
}

/// Execution log subcommands.
#[derive(Subcommand)]
pub(crate) enum RunAction {
    /// Open an execution record and print its id.
    Start {
        #[arg(long)]
        pipeline: String,

        #[arg(long)]
        activity: String,

        #[arg(long)]
        source: Option<SourceId>,

        /// External correlation id from the orchestrator.
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Close an execution record with its outcome.
    End {
        execution_id: ExecutionId,

        /// success, failed, or quarantined.
        #[arg(long)]
        status: TerminalStatus,

        #[arg(long, default_value_t = 0)]
        rows_processed: u64,

        #[arg(long, default_value_t = 0)]
        rows_failed: u64,

        #[arg(long)]
        error: Option<String>,
    },
    /// Show one execution record.
    Show { execution_id: ExecutionId },
    /// List run history, newest first.
    List {
        #[arg(long)]
        source: Option<SourceId>,

        #[arg(long)]
        pipeline: Option<String>,

        #[arg(long)]
        run_id: Option<String>,

        #[arg(long)]
        status: Option<RunStatus>,

        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// List runs still STARTED after the given age.
    Open {
        #[arg(long, default_value_t = 60)]
        older_than_mins: i64,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "loadctl=info,loadctl_core=info,loadctl_storage=info",
        1 => "loadctl=debug,loadctl_core=debug,loadctl_storage=debug,loadctl_shared=debug",
        _ => "loadctl=trace,loadctl_core=trace,loadctl_storage=trace,loadctl_shared=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let out = Output { json: cli.json };
    let db = cli.db.clone();

    match cli.command {
        Command::Source { action } => cmd_source(action, &config, db, out).await,
        Command::Watermark { action } => cmd_watermark(action, &config, db, out).await,
        Command::Run { action } => cmd_run(action, &config, db, out).await,
        Command::Plan { source_id } => {
            let plane = ControlPlane::open_readonly(&config, db.as_deref()).await?;
            let plan = plane.plan_extract(source_id).await?;
            out.emit(&plan, || print_plan(&plan))
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config),
        },
    }
}

async fn cmd_source(
    action: SourceAction,
    config: &AppConfig,
    db: Option<PathBuf>,
    out: Output,
) -> Result<()> {
    match action {
        SourceAction::Register {
            name,
            source_type,
            location,
            table,
            strategy,
            merge_key,
        } => {
            let plane = ControlPlane::open(config, db.as_deref()).await?;
            let source = NewSource {
                name,
                source_type,
                location,
                target_table: table,
                load_strategy: strategy,
                merge_key,
            };
            let id = plane.register_source(&source).await?;
            out.emit(&serde_json::json!({ "source_id": id }), || println!("{id}"))
        }
        SourceAction::List { id, all } => {
            let plane = ControlPlane::open_readonly(config, db.as_deref()).await?;
            let sources = if all {
                plane.list_all_sources().await?
            } else {
                plane.get_source_config(id).await?
            };
            out.emit(&sources, || print_sources(&sources))
        }
        SourceAction::Deactivate { id } => {
            let plane = ControlPlane::open(config, db.as_deref()).await?;
            let source = plane.deactivate_source(id).await?;
            out.emit(&source, || println!("deactivated source {} ({})", source.id, source.name))
        }
        SourceAction::Activate { id } => {
            let plane = ControlPlane::open(config, db.as_deref()).await?;
            let source = plane.activate_source(id).await?;
            out.emit(&source, || println!("activated source {} ({})", source.id, source.name))
        }
        SourceAction::Sync => {
            if config.sources.is_empty() {
                return Err(eyre!("no [[sources]] entries in the config file"));
            }
            let plane = ControlPlane::open(config, db.as_deref()).await?;
            let registered = plane.sync_sources(&config.sources).await?;
            info!(count = registered.len(), "source sync finished");
            out.emit(&registered, || {
                for name in &registered {
                    println!("registered {name}");
                }
                println!(
                    "{} of {} configured sources registered",
                    registered.len(),
                    config.sources.len()
                );
            })
        }
    }
}

async fn cmd_watermark(
    action: WatermarkAction,
    config: &AppConfig,
    db: Option<PathBuf>,
    out: Output,
) -> Result<()> {
    match action {
        WatermarkAction::Advance {
            source_id,
            column,
            value,
            expect,
            expect_none,
        } => {
            let plane = ControlPlane::open(config, db.as_deref()).await?;
            let advanced = if expect_none || expect.is_some() {
                plane
                    .compare_and_advance_watermark(source_id, &column, expect.as_deref(), &value)
                    .await?
            } else {
                plane.advance_watermark(source_id, &column, &value).await?
            };
            out.emit(&advanced, || {
                println!(
                    "{}.{}: {} -> {}",
                    advanced.source_id,
                    advanced.column_name,
                    advanced.previous.as_deref().unwrap_or("<none>"),
                    advanced.current
                )
            })
        }
        WatermarkAction::Get { source_id, column } => {
            let plane = ControlPlane::open_readonly(config, db.as_deref()).await?;
            let watermark = plane
                .get_watermark(source_id, &column)
                .await?
                .ok_or_else(|| eyre!("no watermark for source {source_id} column '{column}'"))?;
            out.emit(&watermark, || print_watermarks(std::slice::from_ref(&watermark)))
        }
        WatermarkAction::List { source_id } => {
            let plane = ControlPlane::open_readonly(config, db.as_deref()).await?;
            let watermarks = plane.list_watermarks(source_id).await?;
            out.emit(&watermarks, || print_watermarks(&watermarks))
        }
    }
}

async fn cmd_run(
    action: RunAction,
    config: &AppConfig,
    db: Option<PathBuf>,
    out: Output,
) -> Result<()> {
    match action {
        RunAction::Start {
            pipeline,
            activity,
            source,
            run_id,
        } => {
            let plane = ControlPlane::open(config, db.as_deref()).await?;
            let run = NewRun {
                pipeline_name: pipeline,
                activity_name: activity,
                source_id: source,
                run_id,
            };
            let id = plane.start_run(&run).await?;
            out.emit(&serde_json::json!({ "execution_id": id }), || println!("{id}"))
        }
        RunAction::End {
            execution_id,
            status,
            rows_processed,
            rows_failed,
            error,
        } => {
            let plane = ControlPlane::open(config, db.as_deref()).await?;
            let outcome = RunOutcome {
                status,
                rows_processed,
                rows_failed,
                error_message: error,
            };
            let record = plane.end_run(execution_id, &outcome).await?;
            out.emit(&record, || print_runs(std::slice::from_ref(&record)))
        }
        RunAction::Show { execution_id } => {
            let plane = ControlPlane::open_readonly(config, db.as_deref()).await?;
            let record = plane
                .get_execution(execution_id)
                .await?
                .ok_or_else(|| eyre!("no execution with id {execution_id}"))?;
            out.emit(&record, || print_runs(std::slice::from_ref(&record)))
        }
        RunAction::List {
            source,
            pipeline,
            run_id,
            status,
            limit,
        } => {
            let plane = ControlPlane::open_readonly(config, db.as_deref()).await?;
            let filter = RunFilter {
                source_id: source,
                pipeline_name: pipeline,
                run_id,
                status,
                limit: Some(limit),
            };
            let records = plane.list_executions(&filter).await?;
            out.emit(&records, || print_runs(&records))
        }
        RunAction::Open { older_than_mins } => {
            let plane = ControlPlane::open_readonly(config, db.as_deref()).await?;
            let records = plane
                .list_open_runs(chrono::Duration::minutes(older_than_mins))
                .await?;
            out.emit(&records, || print_runs(&records))
        }
    }
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    /// Print `value` as JSON when `--json` is set, otherwise run `text`.
    fn emit<T: Serialize>(self, value: &T, text: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text();
        }
        Ok(())
    }
}

fn print_sources(sources: &[SourceConfig]) {
    if sources.is_empty() {
        println!("no sources");
        return;
    }
    println!(
        "{:>4}  {:<20} {:<9} {:<12} {:<14} {:<20} {}",
        "ID", "NAME", "TYPE", "STRATEGY", "MERGE KEY", "TARGET", "ACTIVE"
    );
    for s in sources {
        println!(
            "{:>4}  {:<20} {:<9} {:<12} {:<14} {:<20} {}",
            s.id,
            s.name,
            s.source_type,
            s.load_strategy,
            s.merge_key.as_deref().unwrap_or("-"),
            s.target_table,
            if s.active { "yes" } else { "no" }
        );
    }
}

fn print_watermarks(watermarks: &[Watermark]) {
    if watermarks.is_empty() {
        println!("no watermarks");
        return;
    }
    for w in watermarks {
        println!(
            "{}.{}  current={}  last={}  updated={}",
            w.source_id,
            w.column_name,
            w.current_value,
            w.last_value.as_deref().unwrap_or("<none>"),
            w.updated_at.to_rfc3339()
        );
    }
}

fn print_runs(records: &[ExecutionRecord]) {
    if records.is_empty() {
        println!("no executions");
        return;
    }
    for r in records {
        let source = r
            .source_id
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".into());
        let completed = r
            .completed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        println!(
            "{}  {:<11} {}/{}  source={}  started={}  completed={}  rows={}/{}",
            r.execution_id,
            r.status,
            r.pipeline_name,
            r.activity_name,
            source,
            r.started_at.to_rfc3339(),
            completed,
            r.rows_processed,
            r.rows_failed
        );
        if let Some(err) = &r.error_message {
            println!("    error: {err}");
        }
    }
}

fn print_plan(plan: &ExtractPlan) {
    match plan {
        ExtractPlan::Full {
            source_id,
            location,
            target_table,
        } => println!("source {source_id}: FULL load {location} -> {target_table}"),
        ExtractPlan::Incremental {
            source_id,
            location,
            target_table,
            column,
            since,
        } => match since {
            Some(since) => println!(
                "source {source_id}: INCREMENTAL load {location} -> {target_table} where {column} > {since}"
            ),
            None => println!(
                "source {source_id}: INCREMENTAL load {location} -> {target_table} (no watermark on {column} yet, reading all rows)"
            ),
        },
    }
}

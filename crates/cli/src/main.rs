use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use mangrove_core::config::EngineConfig;
use mangrove_core::db::{self, ReportQuery};
use mangrove_core::schema::{
    Analisis, Cause, ClassifierOutput, Condition, Coordinate, Measurements, NewLocation, Outcome,
    ReportDraft, ReportRecord, ReportStatus,
};
use mangrove_core::TriageEngine;
use schemars::schema_for;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mangrove")]
#[command(about = "Mangrove report moderation and condition triage", long_about = None)]
struct Cli {
    /// SQLite database path (overrides [database] path in triage.toml)
    #[arg(long, global = true, env = "MANGROVE_DB")]
    db: Option<PathBuf>,

    /// Directory holding triage.toml and keywords.yaml
    #[arg(long, global = true, default_value = "config")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export canonical JSON Schemas to the ./schemas directory
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
    /// Register and inspect monitored sites
    Site {
        #[command(subcommand)]
        command: SiteCommands,
    },
    /// Submit, moderate and analyze field reports
    Report {
        #[command(subcommand)]
        command: ReportCommands,
    },
    /// Print the intervention queue, most urgent first
    Triage {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Render the database into a markdown vault
    Vault {
        #[command(subcommand)]
        command: VaultCommands,
    },
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// Export JSON Schema files for canonical types
    Export {
        /// Output directory (default: ./schemas)
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum SiteCommands {
    Add {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        /// Hectares
        #[arg(long)]
        area: Option<f64>,
        #[arg(long)]
        description: Option<String>,
    },
    Show {
        id: String,
    },
    List,
}

#[derive(Subcommand)]
enum ReportCommands {
    /// Submit a report from flags or from a ReportDraft JSON file
    Submit(SubmitArgs),
    /// Record the moderation outcome of a pending report
    Decide {
        id: String,
        #[arg(long)]
        outcome: Outcome,
        #[arg(long)]
        moderator: String,
    },
    Show {
        id: String,
    },
    List {
        #[arg(long)]
        site: Option<String>,
        #[arg(long)]
        status: Option<ReportStatus>,
        /// Only reports waiting for an analysis retry
        #[arg(long)]
        pending_analysis: bool,
    },
    /// Analyze a valid report again, optionally with explicit classifier output
    Reanalyze {
        id: String,
        #[arg(long)]
        condition: Option<Condition>,
        #[arg(long)]
        confidence: Option<f64>,
        #[arg(long)]
        cause: Option<Cause>,
        /// Replace the current analysis
        #[arg(long)]
        supersede: bool,
    },
    /// Retry analyses deferred by classifier failures
    Retry,
}

#[derive(Args)]
struct SubmitArgs {
    /// ReportDraft JSON file; other flags are ignored when set
    #[arg(long, conflicts_with_all = ["site", "report_type", "body"])]
    json: Option<PathBuf>,
    #[arg(long)]
    site: Option<String>,
    #[arg(long = "type")]
    report_type: Option<String>,
    #[arg(long)]
    body: Option<String>,
    #[arg(long)]
    submitter: Option<String>,
    #[arg(long)]
    species: Option<String>,
    #[arg(long)]
    photo: Option<String>,
    #[arg(long)]
    count: Option<u32>,
    #[arg(long)]
    density: Option<f64>,
    #[arg(long)]
    height: Option<f64>,
    #[arg(long)]
    diameter: Option<f64>,
    #[arg(long)]
    area: Option<f64>,
}

#[derive(Subcommand)]
enum VaultCommands {
    /// Write site notes, report notes and the triage board
    Build {
        #[arg(long, default_value = "vault")]
        out_dir: PathBuf,
    },
}

#[derive(Serialize)]
struct ReportView {
    report: ReportRecord,
    analysis: Option<Analisis>,
    history: Vec<Analisis>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Schema { command } => match command {
            SchemaCommands::Export { out_dir } => schema_export(out_dir),
        },
        Commands::Site { command } => {
            let engine = open_engine(cli.db, &cli.config)?;
            site_command(&engine, command)
        }
        Commands::Report { command } => {
            let mut engine = open_engine(cli.db, &cli.config)?;
            report_command(&mut engine, command)
        }
        Commands::Triage { limit } => {
            let engine = open_engine(cli.db, &cli.config)?;
            print_json(&engine.triage_queue(limit)?)
        }
        Commands::Vault { command } => match command {
            VaultCommands::Build { out_dir } => {
                let engine = open_engine(cli.db, &cli.config)?;
                let summary = vault::build_vault(engine.connection(), &out_dir)?;
                println!(
                    "Wrote {} site notes, {} report notes and {} triage entries to {}",
                    summary.sites,
                    summary.reports,
                    summary.triage_entries,
                    out_dir.display()
                );
                Ok(())
            }
        },
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "mangrove=debug,mangrove_core=debug"
    } else {
        "mangrove=info,mangrove_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_engine(db_arg: Option<PathBuf>, config_dir: &Path) -> Result<TriageEngine> {
    let config = EngineConfig::load_from_dir(config_dir)
        .with_context(|| format!("loading config from {}", config_dir.display()))?;
    let db_path = db_arg
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| PathBuf::from("mangrove.db"));
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let conn = db::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
    info!(db = %db_path.display(), "database opened");
    Ok(TriageEngine::new(conn, &config))
}

fn site_command(engine: &TriageEngine, command: SiteCommands) -> Result<()> {
    match command {
        SiteCommands::Add {
            id,
            name,
            lat,
            lon,
            area,
            description,
        } => {
            let site = engine.create_site(NewLocation {
                id,
                name,
                coordinate: Coordinate {
                    latitude: lat,
                    longitude: lon,
                },
                area,
                description,
            })?;
            print_json(&site)
        }
        SiteCommands::Show { id } => print_json(&engine.get_site(&id)?),
        SiteCommands::List => print_json(&engine.list_sites()?),
    }
}

fn report_command(engine: &mut TriageEngine, command: ReportCommands) -> Result<()> {
    match command {
        ReportCommands::Submit(args) => {
            let draft = build_draft(args)?;
            print_json(&engine.submit(draft)?)
        }
        ReportCommands::Decide {
            id,
            outcome,
            moderator,
        } => print_json(&engine.decide(&id, outcome, &moderator)?),
        ReportCommands::Show { id } => {
            let view = ReportView {
                report: engine.get_report(&id)?,
                analysis: engine.current_analysis(&id)?,
                history: engine.analysis_history(&id)?,
            };
            print_json(&view)
        }
        ReportCommands::List {
            site,
            status,
            pending_analysis,
        } => {
            let query = ReportQuery {
                site_id: site,
                status,
                analysis_pending: pending_analysis.then_some(true),
            };
            print_json(&engine.list_reports(&query)?)
        }
        ReportCommands::Reanalyze {
            id,
            condition,
            confidence,
            cause,
            supersede,
        } => {
            let output = match (condition, confidence, cause) {
                (Some(condition), Some(confidence), Some(cause)) => Some(ClassifierOutput {
                    condition,
                    confidence,
                    cause,
                }),
                (None, None, None) => None,
                _ => bail!("--condition, --confidence and --cause must be given together"),
            };
            print_json(&engine.reanalyze(&id, output, supersede)?)
        }
        ReportCommands::Retry => {
            let summary = engine.retry_pending_analyses()?;
            println!(
                "Retried {} analyses: {} completed, {} still pending",
                summary.attempted, summary.completed, summary.still_pending
            );
            Ok(())
        }
    }
}

fn build_draft(args: SubmitArgs) -> Result<ReportDraft> {
    if let Some(path) = args.json {
        let raw = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        return serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()));
    }
    Ok(ReportDraft {
        site_id: args.site.unwrap_or_default(),
        submitter_id: args.submitter,
        species_id: args.species,
        report_type: args.report_type.unwrap_or_default(),
        body: args.body.unwrap_or_default(),
        photo_ref: args.photo,
        measurements: Measurements {
            specimen_count: args.count,
            density: args.density,
            avg_height: args.height,
            avg_diameter: args.diameter,
            area: args.area,
        },
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn schema_export(out_dir: PathBuf) -> Result<()> {
    fs::create_dir_all(&out_dir)?;

    let report_draft_schema = schema_for!(ReportDraft);
    fs::write(
        out_dir.join("ReportDraft.schema.json"),
        serde_json::to_string_pretty(&report_draft_schema)?,
    )?;

    let report_schema = schema_for!(ReportRecord);
    fs::write(
        out_dir.join("ReportRecord.schema.json"),
        serde_json::to_string_pretty(&report_schema)?,
    )?;

    let analysis_schema = schema_for!(Analisis);
    fs::write(
        out_dir.join("Analisis.schema.json"),
        serde_json::to_string_pretty(&analysis_schema)?,
    )?;

    let location_schema = schema_for!(mangrove_core::schema::LocationAggregate);
    fs::write(
        out_dir.join("LocationAggregate.schema.json"),
        serde_json::to_string_pretty(&location_schema)?,
    )?;

    let classifier_schema = schema_for!(ClassifierOutput);
    fs::write(
        out_dir.join("ClassifierOutput.schema.json"),
        serde_json::to_string_pretty(&classifier_schema)?,
    )?;

    println!("Exported schemas to {}", out_dir.display());
    Ok(())
}

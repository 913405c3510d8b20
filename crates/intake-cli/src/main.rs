use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use intake_api::{
    IntakeApi, IntakeConfig, PickupStatusUpdate, PrimaryDatabase, SubmitComplaintRequest,
    SubmitPickupRequest,
};
use intake_core::{Page, RecordFilter, RecordKind, RecordStatus};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "intake")]
#[command(about = "Civic intake operator CLI")]
struct Cli {
    /// YAML config file. The flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    primary_db: Option<PathBuf>,

    #[arg(long, global = true)]
    fallback_log: Option<PathBuf>,

    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Submit {
        #[command(subcommand)]
        command: Box<SubmitCommand>,
    },
    Show {
        id: String,
    },
    List(ListArgs),
    Status {
        id: String,
        #[arg(value_parser = parse_status)]
        status: RecordStatus,
    },
    Pickup {
        #[command(subcommand)]
        command: PickupCommand,
    },
    Reconcile,
    Fallback {
        #[command(subcommand)]
        command: FallbackCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SubmitCommand {
    Complaint(ComplaintArgs),
    Pickup(PickupArgs),
}

#[derive(Debug, Args)]
struct ComplaintArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    location: String,
    #[arg(long)]
    description: String,
    #[arg(long)]
    department: String,
    #[arg(long)]
    urgency: String,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    latitude: Option<f64>,
    #[arg(long)]
    longitude: Option<f64>,
}

#[derive(Debug, Args)]
struct PickupArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    phone: String,
    #[arg(long)]
    address: String,
    /// Repeat for each material.
    #[arg(long = "material", required = true)]
    materials: Vec<String>,
    #[arg(long)]
    preferred_date: String,
    #[arg(long)]
    preferred_time: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    quantity: Option<String>,
    #[arg(long)]
    instructions: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Complaint,
    Pickup,
}

impl From<KindArg> for RecordKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Complaint => Self::Complaint,
            KindArg::Pickup => Self::Pickup,
        }
    }
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_enum)]
    kind: Option<KindArg>,
    #[arg(long, value_parser = parse_status)]
    status: Option<RecordStatus>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = intake_core::DEFAULT_PAGE_LIMIT)]
    limit: u32,
}

#[derive(Debug, Subcommand)]
enum PickupCommand {
    Status(PickupStatusArgs),
    Search { query: String },
    Stats,
}

#[derive(Debug, Args)]
struct PickupStatusArgs {
    id: String,
    #[arg(value_parser = parse_status)]
    status: RecordStatus,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    pickup_date: Option<String>,
    #[arg(long)]
    pickup_time: Option<String>,
    #[arg(long)]
    driver: Option<String>,
}

#[derive(Debug, Subcommand)]
enum FallbackCommand {
    Stats,
    /// Raw log entries including sync metadata.
    Entries,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

fn parse_status(raw: &str) -> Result<RecordStatus, String> {
    RecordStatus::parse(raw).ok_or_else(|| {
        format!(
            "unknown status {raw:?}; expected one of Pending, Processing, Resolved, Confirmed, \
             In Progress, Completed, Cancelled"
        )
    })
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

impl Cli {
    fn resolve_config(&self) -> Result<IntakeConfig> {
        let mut config = IntakeConfig::load(self.config.as_deref())?;
        if let Some(path) = &self.primary_db {
            config.primary_db.clone_from(path);
        }
        if let Some(path) = &self.fallback_log {
            config.fallback_log.clone_from(path);
        }
        Ok(config)
    }
}

fn prepare_fallback_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create fallback directory {}", parent.display()))?;
    }
    Ok(())
}

fn open_api(config: &IntakeConfig) -> Result<IntakeApi> {
    prepare_fallback_dir(&config.fallback_log)?;
    tracing::debug!(
        primary_db = %config.primary_db.display(),
        fallback_log = %config.fallback_log.display(),
        "opening intake api"
    );
    Ok(IntakeApi::from_config(config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let config = cli.resolve_config()?;
    match cli.command {
        Command::Db { command } => {
            run_db(command, &PrimaryDatabase::new(config.primary_db.clone(), config.busy_timeout()))
        }
        Command::Submit { command } => run_submit(*command, &open_api(&config)?),
        Command::Show { id } => emit(&open_api(&config)?.get(&id)?),
        Command::List(args) => {
            let filter = RecordFilter {
                kind: args.kind.map(RecordKind::from),
                status: args.status,
                search: args.search,
                ..RecordFilter::default()
            };
            let page = Page::new(args.page, args.limit)?;
            emit(&open_api(&config)?.list(&filter, page)?)
        }
        Command::Status { id, status } => emit(&open_api(&config)?.update_status(&id, status)?),
        Command::Pickup { command } => run_pickup(command, &open_api(&config)?),
        Command::Reconcile => emit(&open_api(&config)?.reconcile()?),
        Command::Fallback { command } => {
            let api = open_api(&config)?;
            match command {
                FallbackCommand::Stats => emit(&api.fallback_stats()?),
                FallbackCommand::Entries => {
                    let entries = api.fallback_entries()?;
                    emit_json(serde_json::json!({ "entries": entries }))
                }
            }
        }
    }
}

fn run_submit(command: SubmitCommand, api: &IntakeApi) -> Result<()> {
    match command {
        SubmitCommand::Complaint(args) => emit(&api.submit_complaint(SubmitComplaintRequest {
            name: args.name,
            location: args.location,
            description: args.description,
            department: args.department,
            urgency: args.urgency,
            phone: args.phone,
            latitude: args.latitude,
            longitude: args.longitude,
            category: args.category,
            ..SubmitComplaintRequest::default()
        })?),
        SubmitCommand::Pickup(args) => emit(&api.submit_pickup(SubmitPickupRequest {
            name: args.name,
            phone: args.phone,
            address: args.address,
            materials: args.materials,
            preferred_date: args.preferred_date,
            preferred_time: args.preferred_time,
            email: args.email,
            quantity: args.quantity,
            special_instructions: args.instructions,
            ..SubmitPickupRequest::default()
        })?),
    }
}

fn run_pickup(command: PickupCommand, api: &IntakeApi) -> Result<()> {
    match command {
        PickupCommand::Status(args) => emit(&api.update_pickup_status(
            &args.id,
            PickupStatusUpdate {
                status: args.status,
                notes: args.notes,
                pickup_date: args.pickup_date,
                pickup_time: args.pickup_time,
                assigned_driver: args.driver,
            },
        )?),
        PickupCommand::Search { query } => emit(&api.search_pickups(&query)?),
        PickupCommand::Stats => emit(&api.pickup_stats()?),
    }
}

fn run_db(command: DbCommand, database: &PrimaryDatabase) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = database.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => emit(&database.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => emit(&database.integrity_check()?),
        DbCommand::Backup(args) => {
            database.migrate(false)?;
            database.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
    }
}

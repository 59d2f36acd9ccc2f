use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use secret_santa_api::{load_pairing_config, Caller, RegisterParticipantRequest, SecretSantaApi};
use secret_santa_core::{compute_assignment_with_rng, PairingConfig, RawParticipant};
use secret_santa_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "santa")]
#[command(about = "Secret Santa pairing CLI")]
struct Cli {
    #[arg(long, env = "SANTA_DB", default_value = "./secret_santa.sqlite3")]
    db: PathBuf,

    /// YAML file with pairing tunables.
    #[arg(long, env = "SANTA_CONFIG")]
    config: Option<PathBuf>,

    /// Cap on tentative placements per pairing run; overrides the config file.
    #[arg(long, env = "SANTA_MAX_PLACEMENTS")]
    max_placements: Option<u64>,

    /// Email of the acting user, as the auth gateway would assert it.
    #[arg(long = "as", env = "SANTA_CALLER_EMAIL")]
    caller: Option<String>,

    #[arg(long, env = "SANTA_LOG", default_value = "warn")]
    log_level: String,

    #[arg(long, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Participant {
        #[command(subcommand)]
        command: ParticipantCommand,
    },
    Pair {
        #[command(subcommand)]
        command: PairCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ParticipantCommand {
    Add(ParticipantAddArgs),
    List,
    /// Replace the acting user's wishlist.
    Wishlist(WishlistArgs),
}

#[derive(Debug, Args)]
struct ParticipantAddArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value_t = false)]
    admin: bool,
    #[arg(long = "conflict")]
    conflicts: Vec<String>,
    #[arg(long, default_value = "")]
    wishlist: String,
}

#[derive(Debug, Args)]
struct WishlistArgs {
    #[arg(long)]
    text: String,
}

#[derive(Debug, Subcommand)]
enum PairCommand {
    /// Compute and lock in the pairing. Admin only, runs once.
    Run,
    Status,
    /// Show the acting user's giftee.
    Giftee,
    /// Compute a pairing without saving it.
    Preview(PreviewArgs),
}

#[derive(Debug, Args)]
struct PreviewArgs {
    /// JSON array of participant records to pair instead of the database roster.
    #[arg(long = "in")]
    input: Option<PathBuf>,
    #[arg(long)]
    seed: Option<u64>,
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

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn init_tracing(log_level: &str, json_logs: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let config = load_pairing_config(cli.config.as_deref(), cli.max_placements)?;
    let caller = cli.caller.map_or_else(Caller::anonymous, Caller::with_email);

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Participant { command } => {
            run_participant(command, &SecretSantaApi::new(cli.db, config), &caller)
        }
        Command::Pair { command } => run_pair(command, &SecretSantaApi::new(cli.db, config), &caller),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => {
            store.backup_database(&args.out)?;
            tracing::info!(out = %args.out.display(), "database backup written");
            emit_json(serde_json::json!({ "backup_path": args.out.display().to_string() }))
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_participant(command: ParticipantCommand, api: &SecretSantaApi, caller: &Caller) -> Result<()> {
    match command {
        ParticipantCommand::Add(args) => {
            let summary = api.register_participant(RegisterParticipantRequest {
                id: args.id,
                name: args.name,
                is_admin: args.admin,
                conflicts: Value::Array(args.conflicts.into_iter().map(Value::String).collect()),
                wishlist: args.wishlist,
            })?;
            emit(&summary)
        }
        ParticipantCommand::List => emit(&serde_json::json!({ "participants": api.list_participants()? })),
        ParticipantCommand::Wishlist(args) => emit(&api.update_wishlist(caller, &args.text)?),
    }
}

fn run_pair(command: PairCommand, api: &SecretSantaApi, caller: &Caller) -> Result<()> {
    match command {
        PairCommand::Run => {
            let result = api.trigger_pairing(caller)?;
            tracing::info!(
                pairings = result.pairings_count,
                warnings = result.warnings.len(),
                "pairing locked in"
            );
            emit(&result)
        }
        PairCommand::Status => emit(&api.pairing_status()?),
        PairCommand::Giftee => emit(&serde_json::json!({ "giftee": api.my_giftee(caller)? })),
        PairCommand::Preview(args) => match args.input {
            Some(input) => run_preview_file(&input, args.seed, api.config()),
            None => emit(&api.preview_pairing(caller, args.seed)?),
        },
    }
}

fn run_preview_file(input: &std::path::Path, seed: Option<u64>, config: &PairingConfig) -> Result<()> {
    let body = fs::read_to_string(input)
        .with_context(|| format!("failed to read participants file {}", input.display()))?;
    let participants: Vec<RawParticipant> = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse participants file {}", input.display()))?;
    tracing::debug!(path = %input.display(), records = participants.len(), "loaded participants file");

    let mut rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
    let outcome = compute_assignment_with_rng(&participants, config, &mut rng)?;
    emit_json(serde_json::json!({
        "assignment": outcome.assignment,
        "warnings": outcome.warning_messages(),
        "stats": outcome.stats
    }))
}

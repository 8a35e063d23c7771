use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use caldb_core::tabular::{format_real, DEFAULT_DELIMITER};
use caldb_core::{
    AliasList, InputFormat, Parameter, ParameterCandidate, ParameterError, RenamePolicy,
    ValueUpdate, DEFAULT_PREFIX,
};
use caldb_store_sqlite::{rejection, SqliteStore};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

mod config;
mod logging;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "caldb")]
#[command(about = "Calibration parameter database CLI")]
struct Cli {
    /// Database file. Defaults to the first *.db in the working directory.
    #[arg(long, env = "CALDB_DB", global = true)]
    db: Option<PathBuf>,

    /// Print JSON objects instead of text lines.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add a new parameter
    Add(AddArgs),
    /// Change the value of an existing parameter
    Update(UpdateArgs),
    /// Rename a parameter, keeping the old name as an alias
    Rename(RenameArgs),
    /// Load parameters from a CSV or JSON file
    Load(LoadArgs),
    /// Export the database to CSV
    Export(ExportArgs),
    /// Show one parameter by MID, UID, name, or alias
    Show(ShowArgs),
    /// List every parameter
    List,
    /// Write a SQLite backup of the database
    Backup(BackupArgs),
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = DEFAULT_PREFIX)]
    prefix: String,
    #[arg(long)]
    value: Option<String>,
    #[arg(long)]
    comment: Option<String>,
    #[arg(long)]
    datatype: Option<String>,
    #[arg(long)]
    unit: Option<String>,
    #[arg(long)]
    size: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    min: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    max: Option<f64>,
    #[arg(long)]
    description: Option<String>,
    /// Semicolon-separated aliases
    #[arg(long)]
    aliases: Option<String>,
    #[arg(long)]
    mod_comment: Option<String>,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    value: Option<String>,
    #[arg(long)]
    mod_comment: Option<String>,
}

#[derive(Debug, Args)]
struct RenameArgs {
    /// Parameter MID, UID, or name
    #[arg(long)]
    identifier: String,
    #[arg(long)]
    new_name: String,
    #[arg(long)]
    mod_comment: Option<String>,
    /// Accept a new name that another record already uses
    #[arg(long, default_value_t = false)]
    allow_collision: bool,
}

#[derive(Debug, Args)]
struct LoadArgs {
    /// Input file. Defaults to the database path with a .csv extension.
    #[arg(long)]
    file: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_PREFIX)]
    prefix: String,
    #[arg(long = "type", value_enum, default_value_t = FormatArg::Csv)]
    format: FormatArg,
    #[arg(long, default_value_t = DEFAULT_DELIMITER)]
    delimiter: char,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Output file. Defaults to the database path with a .csv extension.
    #[arg(long)]
    file: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_DELIMITER)]
    delimiter: char,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long)]
    identifier: String,
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Csv,
    Json,
}

impl From<FormatArg> for InputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Csv => Self::Csv,
            FormatArg::Json => Self::Json,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn report(self, text: &str, value: Value) -> Result<()> {
        if self.json {
            emit_json(value)
        } else {
            println!("{text}");
            Ok(())
        }
    }
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
    let rendered = serde_json::to_string_pretty(&with_contract_version(value))?;
    println!("{rendered}");
    Ok(())
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init_subscriber(cli.verbose);

    let cwd = std::env::current_dir().context("failed to read working directory")?;
    let db_path = config::resolve_db_path(cli.db, &cwd)?;
    config::ensure_parent_dir(&db_path)?;
    tracing::debug!(db = %db_path.display(), "opening calibration database");

    let mut store = SqliteStore::open(&db_path)?;
    let output = Output { json: cli.json };
    let outcome = run(cli.command, &mut store, &db_path, output);
    let closed = store.close();
    exit_status(outcome, closed)
}

/// Fold the command outcome and the result of closing the database into the
/// process exit status. A close failure only decides the status when the
/// command itself succeeded.
fn exit_status(outcome: Result<()>, closed: Result<()>) -> Result<ExitCode> {
    let err = match outcome {
        Ok(()) => {
            closed?;
            return Ok(ExitCode::SUCCESS);
        }
        Err(err) => err,
    };

    if let Err(close_err) = closed {
        tracing::warn!("failed to close database after a failed command: {close_err:#}");
    }
    match rejection(&err) {
        Some(rejected) => {
            eprintln!("Warning: {rejected}");
            Ok(ExitCode::FAILURE)
        }
        None => Err(err),
    }
}

fn run(command: Command, store: &mut SqliteStore, db_path: &Path, output: Output) -> Result<()> {
    match command {
        Command::Add(args) => run_add(args, store, output),
        Command::Update(args) => run_update(args, store, output),
        Command::Rename(args) => run_rename(&args, store, output),
        Command::Load(args) => run_load(&args, store, db_path, output),
        Command::Export(args) => run_export(&args, store, db_path, output),
        Command::Show(args) => run_show(&args, store, output),
        Command::List => run_list(store, output),
        Command::Backup(args) => run_backup(&args, store, output),
    }
}

fn run_add(args: AddArgs, store: &mut SqliteStore, output: Output) -> Result<()> {
    let candidate = ParameterCandidate {
        name: args.name,
        value: args.value,
        comment: args.comment,
        data_type: args.datatype,
        unit: args.unit,
        size: args.size,
        min: args.min,
        max: args.max,
        description: args.description,
        aliases: args
            .aliases
            .as_deref()
            .map(AliasList::parse)
            .unwrap_or_default(),
        modification_comment: args.mod_comment,
    }
    .normalized();
    let name = candidate.name.clone();

    let identity = store.add(&args.prefix, candidate)?;
    output.report(
        &format!(
            "Added parameter {name} with MID {} and UID {}",
            identity.machine_id, identity.user_id
        ),
        serde_json::json!({
            "status": "added",
            "name": name,
            "machine_id": identity.machine_id,
            "user_id": identity.user_id
        }),
    )
}

fn run_update(args: UpdateArgs, store: &mut SqliteStore, output: Output) -> Result<()> {
    let update = ValueUpdate {
        name: args.name,
        value: args.value,
        modification_comment: args.mod_comment,
    };
    let identity = store.update(&update)?;
    output.report(
        &format!(
            "Updated parameter {} with MID {} and UID {}",
            update.name, identity.machine_id, identity.user_id
        ),
        serde_json::json!({
            "status": "updated",
            "name": update.name,
            "machine_id": identity.machine_id,
            "user_id": identity.user_id
        }),
    )
}

fn run_rename(args: &RenameArgs, store: &mut SqliteStore, output: Output) -> Result<()> {
    let policy = if args.allow_collision {
        RenamePolicy::Permissive
    } else {
        RenamePolicy::Strict
    };
    let outcome = store.rename(
        &args.identifier,
        &args.new_name,
        args.mod_comment.as_deref(),
        policy,
    )?;
    output.report(
        &format!(
            "Renamed parameter from {} to {}. UID {} and MID {} remain the same.",
            outcome.old_name,
            outcome.new_name,
            outcome.identity.user_id,
            outcome.identity.machine_id
        ),
        serde_json::json!({
            "status": "renamed",
            "old_name": outcome.old_name,
            "new_name": outcome.new_name,
            "machine_id": outcome.identity.machine_id,
            "user_id": outcome.identity.user_id,
            "policy": policy.as_str()
        }),
    )
}

fn run_load(
    args: &LoadArgs,
    store: &mut SqliteStore,
    db_path: &Path,
    output: Output,
) -> Result<()> {
    let file = csv_file(args.file.as_deref(), db_path);
    let format = InputFormat::from(args.format);
    let summary = store.load_file(&file, format, &args.prefix, args.delimiter)?;

    for rejected in &summary.rejected {
        eprintln!(
            "Warning: row {} ({}): {}",
            rejected.row,
            rejected.name.as_deref().unwrap_or("unnamed"),
            rejected.error
        );
    }

    let rejected = summary
        .rejected
        .iter()
        .map(|rejected| {
            serde_json::json!({
                "row": rejected.row,
                "name": rejected.name,
                "error": rejected.error.to_string()
            })
        })
        .collect::<Vec<_>>();
    output.report(
        &format!(
            "Loaded {} of {} parameters from {}",
            summary.added.len(),
            summary.rows(),
            file.display()
        ),
        serde_json::json!({
            "file": file,
            "format": format.as_str(),
            "added": summary.added,
            "rejected": rejected
        }),
    )
}

fn run_export(
    args: &ExportArgs,
    store: &SqliteStore,
    db_path: &Path,
    output: Output,
) -> Result<()> {
    let file = csv_file(args.file.as_deref(), db_path);
    let summary = store.export_csv_file(&file, args.delimiter)?;
    output.report(
        &format!("Database exported to {}", summary.path),
        serde_json::to_value(&summary).context("failed to serialize export summary")?,
    )
}

fn run_show(args: &ShowArgs, store: &SqliteStore, output: Output) -> Result<()> {
    let parameter = match store.resolve(&args.identifier)? {
        Some(parameter) => parameter,
        None => store
            .find_by_alias(&args.identifier)?
            .ok_or_else(|| ParameterError::NotFound {
                identifier: args.identifier.clone(),
            })?,
    };
    output.report(
        &describe(&parameter),
        serde_json::to_value(&parameter).context("failed to serialize parameter")?,
    )
}

fn run_list(store: &SqliteStore, output: Output) -> Result<()> {
    let parameters = store.list_parameters()?;
    let lines = parameters
        .iter()
        .map(|parameter| {
            format!(
                "{}\t{}\t{}\t{}",
                parameter.machine_id,
                parameter.user_id,
                parameter.name,
                parameter.value.as_deref().unwrap_or_default()
            )
        })
        .collect::<Vec<_>>();
    output.report(
        &lines.join("\n"),
        serde_json::json!({
            "count": parameters.len(),
            "parameters": parameters
        }),
    )
}

fn run_backup(args: &BackupArgs, store: &SqliteStore, output: Output) -> Result<()> {
    store.backup_database(&args.out)?;
    output.report(
        &format!("Backup written to {}", args.out.display()),
        serde_json::json!({
            "backup_path": args.out,
            "status": "ok"
        }),
    )
}

fn csv_file(explicit: Option<&Path>, db_path: &Path) -> PathBuf {
    match explicit {
        Some(file) => file.to_path_buf(),
        None => config::default_csv_path(db_path),
    }
}

fn describe(parameter: &Parameter) -> String {
    let optional = |value: Option<&str>| value.unwrap_or_default().to_string();
    let bound = |value: Option<f64>| value.map(format_real).unwrap_or_default();
    [
        ("MID", parameter.machine_id.to_string()),
        ("UID", parameter.user_id.to_string()),
        ("Name", parameter.name.clone()),
        ("Value", optional(parameter.value.as_deref())),
        ("Comment", optional(parameter.comment.as_deref())),
        ("DataType", optional(parameter.data_type.as_deref())),
        ("Unit", optional(parameter.unit.as_deref())),
        ("Size", optional(parameter.size.as_deref())),
        ("Min", bound(parameter.min)),
        ("Max", bound(parameter.max)),
        ("Description", optional(parameter.description.as_deref())),
        ("Aliases", parameter.aliases.to_delimited()),
        ("Modified", parameter.modified_at.to_string()),
        ("ModificationComment", optional(parameter.modification_comment.as_deref())),
        ("PreviousValues", parameter.previous_values.to_delimited()),
    ]
    .iter()
    .map(|(label, value)| format!("{label}: {value}"))
    .collect::<Vec<_>>()
    .join("\n")
}

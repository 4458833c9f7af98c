//! Tally CLI - Log activities from the terminal
//!
//! Every command works offline; writes go to the local queue and reach the
//! server on the next `tally sync` (or while `tally watch` is running).

use std::env;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate, Utc};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::Generator;
use clap_complete::{generate, shells};
use serde::Serialize;
use serde_json::{json, Value};
use tally_core::db::LocalStore;
use tally_core::sync::MergedEntity;
use tally_core::{
    ClientId, HttpSyncTransport, MutationWrite, NetworkWatch, QueueEntry, SyncManager,
    SyncOptions, SyncReport,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Track activities from the command line, online or not")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Quick capture: tally "Morning run"
    #[arg(trailing_var_arg = true)]
    entry: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log a new entry
    #[command(alias = "add")]
    Log {
        /// Entry text
        entry: Vec<String>,
        /// Entity kind to file the entry under
        #[arg(long, default_value = "activity")]
        kind: String,
        /// Day to file the entry under (YYYY-MM-DD, today when omitted)
        #[arg(long, value_name = "DATE")]
        date: Option<String>,
    },
    /// List entries for one day, server data merged with local changes
    List {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Entity kind to list
        #[arg(long, default_value = "activity")]
        kind: String,
        /// Day to list (YYYY-MM-DD, today when omitted)
        #[arg(long, value_name = "DATE")]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an entry
    Delete {
        /// Entity ID or unique ID prefix
        id: String,
        /// Entity kind the entry is filed under
        #[arg(long, default_value = "activity")]
        kind: String,
        /// Day the entry is filed under (YYYY-MM-DD, today when omitted)
        #[arg(long, value_name = "DATE")]
        date: Option<String>,
    },
    /// Push queued local changes and pull server updates
    Sync,
    /// Show queue counts and stuck entries
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Give a failed entry another chance on the next sync
    Retry {
        /// Client ID printed by `tally status`
        client_id: String,
    },
    /// Drop a failed entry and roll back its local effect
    Discard {
        /// Client ID printed by `tally status`
        client_id: String,
    },
    /// Sync continuously until interrupted
    Watch,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] tally_core::Error),
    #[error(transparent)]
    Sync(#[from] tally_core::SyncError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No entry text provided")]
    EmptyEntry,
    #[error("Entity ID cannot be empty")]
    EmptyEntityId,
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("No entry found for id/prefix: {0}")]
    EntryNotFound(String),
    #[error("{0}")]
    AmbiguousEntryId(String),
    #[error(
        "Sync is not configured. Set TALLY_SERVER_URL and TALLY_API_TOKEN to enable `tally sync`."
    )]
    SyncNotConfigured,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tally=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Some(Commands::Log { entry, kind, date }) => {
            run_log(&entry, &kind, date.as_deref(), &db_path)?;
        }
        Some(Commands::List {
            limit,
            kind,
            date,
            json,
        }) => {
            run_list(limit, &kind, date.as_deref(), json, &db_path)?;
        }
        Some(Commands::Delete { id, kind, date }) => {
            run_delete(&id, &kind, date.as_deref(), &db_path)?;
        }
        Some(Commands::Sync) => run_sync(&db_path).await?,
        Some(Commands::Status { json }) => run_status(json, &db_path)?,
        Some(Commands::Retry { client_id }) => run_retry(&client_id, &db_path)?,
        Some(Commands::Discard { client_id }) => run_discard(&client_id, &db_path)?,
        Some(Commands::Watch) => run_watch(&db_path).await?,
        Some(Commands::Completions { shell, output }) => {
            run_completions(shell, output.as_deref())?;
        }
        None => {
            // Quick capture mode: tally "Morning run"
            if cli.entry.is_empty() {
                Cli::command().print_help().map_err(CliError::Io)?;
                println!();
            } else {
                run_log(&cli.entry, "activity", None, &db_path)?;
            }
        }
    }

    Ok(())
}

fn run_log(
    entry_parts: &[String],
    kind: &str,
    date: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let name = resolve_entry_text(entry_parts)?;
    let view_key = resolve_view_date(date)?;

    let manager = open_manager(db_path)?;
    let entity_id = Uuid::now_v7().to_string();
    manager.enqueue(MutationWrite::create(
        kind,
        &entity_id,
        view_key,
        json!({ "name": name }),
    ))?;

    println!("{entity_id}");
    Ok(())
}

#[derive(Debug, Serialize)]
struct EntryListItem {
    id: String,
    name: String,
    view_key: String,
    updated_at: i64,
    relative_time: String,
    synced: bool,
}

fn run_list(
    limit: usize,
    kind: &str,
    date: Option<&str>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let view_key = resolve_view_date(date)?;
    let entries = list_entries(kind, &view_key, limit, db_path)?;

    if as_json {
        let items = entries
            .iter()
            .map(entry_to_list_item)
            .collect::<Vec<EntryListItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if entries.is_empty() {
        println!("No entries for {view_key}");
    } else {
        for line in format_entry_lines(&entries) {
            println!("{line}");
        }
    }

    Ok(())
}

fn run_delete(id: &str, kind: &str, date: Option<&str>, db_path: &Path) -> Result<(), CliError> {
    let query = normalize_entity_identifier(id)?;
    let view_key = resolve_view_date(date)?;

    let manager = open_manager(db_path)?;
    let entries = manager.merged_view(kind, &view_key)?;
    let target = resolve_entry(&entries, &query)?;
    let entity_id = target.record.entity_id.clone();
    let target_view = target.record.view_key.clone();

    manager.enqueue(MutationWrite::delete(kind, &entity_id, target_view))?;
    println!("{entity_id}");
    Ok(())
}

async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    if server_settings_from_env().is_none() {
        return Err(CliError::SyncNotConfigured);
    }

    let manager = open_manager(db_path)?;
    let report = manager.sync_all().await?;
    println!("{}", format_report_line(&report));
    Ok(())
}

#[derive(Debug, Serialize)]
struct FailedEntryItem {
    client_id: String,
    operation: String,
    entity_type: String,
    entity_id: String,
    retry_count: u32,
    rejected: bool,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    pending: usize,
    syncing: usize,
    failed: usize,
    failed_entries: Vec<FailedEntryItem>,
}

fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let manager = open_manager(db_path)?;
    let counts = manager.status()?;
    let failed = manager.list_failed()?;

    if as_json {
        let output = StatusOutput {
            pending: counts.pending,
            syncing: counts.syncing,
            failed: counts.failed,
            failed_entries: failed.iter().map(failed_entry_item).collect(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!(
        "pending {}  syncing {}  failed {}",
        counts.pending, counts.syncing, counts.failed
    );
    if !failed.is_empty() {
        println!();
        for line in format_failed_lines(&failed) {
            println!("{line}");
        }
        println!();
        println!("Use `tally retry <client-id>` or `tally discard <client-id>`.");
    }
    Ok(())
}

fn run_retry(client_id: &str, db_path: &Path) -> Result<(), CliError> {
    let client_id = parse_client_id(client_id)?;
    let manager = open_manager(db_path)?;
    manager.retry_failed(&client_id)?;
    println!("{client_id}");
    Ok(())
}

fn run_discard(client_id: &str, db_path: &Path) -> Result<(), CliError> {
    let client_id = parse_client_id(client_id)?;
    let manager = open_manager(db_path)?;
    manager.discard_failed(&client_id)?;
    println!("{client_id}");
    Ok(())
}

async fn run_watch(db_path: &Path) -> Result<(), CliError> {
    if server_settings_from_env().is_none() {
        return Err(CliError::SyncNotConfigured);
    }

    let manager = open_manager(db_path)?;
    let mut status_rx = manager.subscribe_status();
    let mut data_rx = manager.subscribe_data();
    manager.start_auto_sync();

    let counts = manager.status()?;
    println!(
        "pending {}  syncing {}  failed {}",
        counts.pending, counts.syncing, counts.failed
    );
    println!("Watching; press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let counts = *status_rx.borrow_and_update();
                println!(
                    "pending {}  syncing {}  failed {}",
                    counts.pending, counts.syncing, counts.failed
                );
            }
            changed = data_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let _ = data_rx.borrow_and_update();
                println!("merged new changes from the server");
            }
        }
    }

    manager.stop_auto_sync();
    Ok(())
}

fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let mut command = Cli::command();
    let mut buffer = Vec::new();

    match shell {
        CompletionShell::Bash => generate_for_shell(shells::Bash, &mut command, &mut buffer),
        CompletionShell::Zsh => generate_for_shell(shells::Zsh, &mut command, &mut buffer),
        CompletionShell::Fish => generate_for_shell(shells::Fish, &mut command, &mut buffer),
    }

    if let Some(path) = output_path {
        std::fs::write(path, &buffer)?;
        println!("{}", path.display());
    } else {
        io::stdout().write_all(&buffer)?;
    }

    Ok(())
}

fn generate_for_shell<G: Generator>(
    generator: G,
    command: &mut clap::Command,
    buffer: &mut Vec<u8>,
) {
    generate(generator, command, "tally", buffer);
}

fn list_entries(
    kind: &str,
    view_key: &str,
    limit: usize,
    db_path: &Path,
) -> Result<Vec<MergedEntity>, CliError> {
    let manager = open_manager(db_path)?;
    let mut entries = manager.merged_view(kind, view_key)?;
    entries.truncate(limit);
    Ok(entries)
}

/// Find one entry by exact entity id, falling back to a unique prefix
fn resolve_entry<'a>(
    entries: &'a [MergedEntity],
    query: &str,
) -> Result<&'a MergedEntity, CliError> {
    if let Some(exact) = entries.iter().find(|entry| entry.record.entity_id == query) {
        return Ok(exact);
    }

    let matches = entries
        .iter()
        .filter(|entry| entry.record.entity_id.starts_with(query))
        .collect::<Vec<_>>();

    match matches.len() {
        0 => Err(CliError::EntryNotFound(query.to_string())),
        1 => Ok(matches[0]),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|entry| short_id(&entry.record.entity_id))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousEntryId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

fn format_entry_lines(entries: &[MergedEntity]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    entries
        .iter()
        .map(|entry| {
            let short = short_id(&entry.record.entity_id);
            let name = entry_label(&entry.record.payload);
            let relative_time = format_relative_time(entry.record.updated_at, now_ms);

            if entry.is_offline_data() {
                format!("{short:<13}  {name:<40}  {relative_time:<10}  not synced")
            } else {
                format!("{short:<13}  {name:<40}  {relative_time}")
            }
        })
        .collect()
}

fn entry_to_list_item(entry: &MergedEntity) -> EntryListItem {
    let now_ms = Utc::now().timestamp_millis();
    EntryListItem {
        id: entry.record.entity_id.clone(),
        name: entry_label(&entry.record.payload),
        view_key: entry.record.view_key.clone(),
        updated_at: entry.record.updated_at,
        relative_time: format_relative_time(entry.record.updated_at, now_ms),
        synced: !entry.is_offline_data(),
    }
}

fn failed_entry_item(entry: &QueueEntry) -> FailedEntryItem {
    FailedEntryItem {
        client_id: entry.client_id.to_string(),
        operation: entry.operation.as_str().to_string(),
        entity_type: entry.entity_type.clone(),
        entity_id: entry.entity_id.clone(),
        retry_count: entry.retry_count,
        rejected: entry.rejected,
        error: entry.last_error.clone(),
    }
}

fn format_failed_lines(entries: &[QueueEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let error = entry.last_error.as_deref().unwrap_or("unknown error");
            let detail = if entry.rejected {
                format!("rejected: {error}")
            } else {
                format!("failed after {} attempts: {error}", entry.retry_count)
            };
            format!(
                "{}  {} {} {}  {detail}",
                entry.client_id,
                entry.operation.as_str(),
                entry.entity_type,
                short_id(&entry.entity_id)
            )
        })
        .collect()
}

fn format_report_line(report: &SyncReport) -> String {
    if report.skipped_offline {
        return "Device is offline; nothing was synced".to_string();
    }

    let mut line = format!("applied {}", report.applied);
    for (count, label) in [
        (report.duplicates, "duplicates"),
        (report.retrying, "retrying"),
        (report.rejected, "rejected"),
        (report.failed, "failed"),
        (report.deferred, "deferred"),
    ] {
        if count > 0 {
            line.push_str(&format!(", {label} {count}"));
        }
    }
    line.push_str(&format!(", pulled {}", report.pulled));
    if let Some(error) = &report.pull_error {
        line.push_str(&format!(" (pull failed: {error})"));
    }
    line
}

fn entry_label(payload: &Value) -> String {
    payload
        .get("name")
        .and_then(Value::as_str)
        .map_or_else(|| payload.to_string(), ToString::to_string)
}

fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

fn resolve_entry_text(entry_parts: &[String]) -> Result<String, CliError> {
    if let Some(text) = normalize_entry_text(&entry_parts.join(" ")) {
        return Ok(text);
    }

    if let Some(text) = read_piped_stdin()? {
        return Ok(text);
    }

    Err(CliError::EmptyEntry)
}

fn normalize_entry_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn normalize_entity_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyEntityId)
    } else {
        Ok(trimmed.to_string())
    }
}

fn parse_client_id(raw: &str) -> Result<ClientId, CliError> {
    raw.trim()
        .parse::<ClientId>()
        .map_err(|_| CliError::InvalidClientId(raw.to_string()))
}

fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_entry_text(&buffer))
}

fn resolve_view_date(date: Option<&str>) -> Result<String, CliError> {
    match date {
        None => Ok(Local::now().date_naive().to_string()),
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map(|parsed| parsed.to_string())
            .map_err(|_| CliError::InvalidDate(raw.to_string())),
    }
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("TALLY_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally")
        .join("tally.db")
}

struct ServerSettings {
    base_url: String,
    token: String,
}

fn server_settings_from_env() -> Option<ServerSettings> {
    let base_url = env::var("TALLY_SERVER_URL").ok()?;
    let token = env::var("TALLY_API_TOKEN").ok()?;

    if base_url.is_empty() || token.is_empty() {
        return None;
    }

    Some(ServerSettings { base_url, token })
}

fn user_from_env() -> String {
    env::var("TALLY_USER")
        .ok()
        .map(|user| user.trim().to_string())
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

fn open_manager(db_path: &Path) -> Result<SyncManager<HttpSyncTransport>, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = LocalStore::open(db_path)?;

    // Without server settings the manager still serves local reads and
    // writes; the network watch stays offline so nothing ever dials out.
    let (transport, online) = match server_settings_from_env() {
        Some(settings) => {
            tracing::debug!("sync server configured");
            let transport = HttpSyncTransport::new(settings.base_url, settings.token)?;
            (transport, true)
        }
        None => {
            let transport = HttpSyncTransport::new("http://127.0.0.1:1", "unconfigured")?;
            (transport, false)
        }
    };

    let net = NetworkWatch::new(online);
    let manager = SyncManager::new(store, transport, net, SyncOptions::new(user_from_env()))?;
    Ok(manager)
}

//! Command surface for the runbook store.
//!
//! Hosts embed this through [`run_cli`] with an already parsed [`Cli`], or
//! through [`run_with_store`] against an open [`SqliteStore`]. Every command
//! prints one pretty JSON document to stdout; diagnostics go to stderr.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use runbook_core::{
    ErrorClass, FilterOptions, KvStore, PlaybookFilterOptions, PlaybookStore, RequesterInfo,
    RunStatus, RunStore,
};
use runbook_store_sqlite::{SqliteStore, StoreConfig};
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "RB_LOG";

#[derive(Debug, Parser)]
#[command(name = "rb")]
#[command(about = "Runbook run and playbook store CLI")]
pub struct Cli {
    #[arg(long, default_value = "./runbook.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value_t = 5000)]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply the relational schema and report its version.
    Migrate,
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    Playbooks {
        #[command(subcommand)]
        command: PlaybooksCommand,
    },
    Kv {
        #[command(subcommand)]
        command: KvCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum RunsCommand {
    List(RunsListArgs),
    Get {
        #[arg(long)]
        id: String,
    },
    /// Resolve the run linked to a channel.
    Channel {
        #[arg(long)]
        channel_id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum PlaybooksCommand {
    List(PlaybooksListArgs),
}

#[derive(Debug, Subcommand)]
pub enum KvCommand {
    /// Load a JSON object of legacy key/value pairs into the store.
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    /// Move legacy key/value records into the relational tables.
    Migrate,
}

#[derive(Debug, Args)]
pub struct RequesterArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    admin: bool,
    #[arg(long)]
    guest: bool,
}

impl RequesterArgs {
    fn requester(&self) -> RequesterInfo {
        RequesterInfo {
            user_id: self.user.clone(),
            is_admin: self.admin,
            is_guest: self.guest,
        }
    }
}

#[derive(Debug, Args)]
pub struct RunsListArgs {
    #[command(flatten)]
    requester: RequesterArgs,
    #[arg(long, default_value = "")]
    team: String,
    #[arg(long, value_enum)]
    status: Vec<StatusArg>,
    #[arg(long, default_value = "")]
    owner: String,
    #[arg(long, default_value = "")]
    participant: String,
    #[arg(long, default_value = "")]
    playbook: String,
    #[arg(long, default_value = "")]
    search: String,
    #[arg(long, default_value = "")]
    sort: String,
    #[arg(long, default_value = "")]
    direction: String,
    #[arg(long, default_value_t = 0)]
    page: i64,
    #[arg(long, default_value_t = 20)]
    per_page: i64,
}

#[derive(Debug, Args)]
pub struct PlaybooksListArgs {
    #[command(flatten)]
    requester: RequesterArgs,
    #[arg(long, default_value = "")]
    team: String,
    #[arg(long, default_value = "")]
    search: String,
    #[arg(long, default_value = "")]
    sort: String,
    #[arg(long, default_value = "")]
    direction: String,
    #[arg(long, default_value_t = 0)]
    page: i64,
    #[arg(long, default_value_t = 20)]
    per_page: i64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Reported,
    InProgress,
    Finished,
    Archived,
}

impl From<StatusArg> for RunStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Reported => Self::Reported,
            StatusArg::InProgress => Self::InProgress,
            StatusArg::Finished => Self::Finished,
            StatusArg::Archived => Self::Archived,
        }
    }
}

/// Installs the stderr log subscriber. Filter directives come from
/// [`LOG_ENV`], falling back to `warn`. Later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Process exit code for a failed command.
#[must_use]
pub fn exit_code(class: ErrorClass) -> i32 {
    match class {
        ErrorClass::Internal => 1,
        ErrorClass::BadRequest => 2,
        ErrorClass::NotFound => 3,
        ErrorClass::DataIntegrity => 4,
    }
}

/// Opens the configured database, applies the schema, and runs the command.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or when the
/// command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = StoreConfig {
        busy_timeout_ms: cli.busy_timeout_ms,
        ..StoreConfig::at(&cli.db)
    };
    let store = SqliteStore::open(&config)?;
    store.migrate()?;
    let output = run_with_store(cli.command, &store)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Runs one command against an open, migrated store and returns its JSON
/// output.
///
/// # Errors
/// Returns an error when argument validation, reading the import file, or
/// the store operation fails.
pub fn run_with_store(command: Command, store: &SqliteStore) -> Result<Value> {
    match command {
        Command::Migrate => Ok(json!({ "schema_version": store.schema_version()? })),
        Command::Runs { command } => run_runs(command, store),
        Command::Playbooks { command } => run_playbooks(command, store),
        Command::Kv { command } => run_kv(command, store),
    }
}

fn run_runs(command: RunsCommand, store: &SqliteStore) -> Result<Value> {
    match command {
        RunsCommand::List(args) => {
            let options = FilterOptions {
                team_id: args.team,
                statuses: args.status.into_iter().map(RunStatus::from).collect(),
                owner_id: args.owner,
                participant_id: args.participant,
                playbook_id: args.playbook,
                search_term: args.search,
                sort: args.sort,
                direction: args.direction,
                page: args.page,
                per_page: args.per_page,
                ..FilterOptions::default()
            };
            to_value(&store.list_runs(&args.requester.requester(), &options)?)
        }
        RunsCommand::Get { id } => to_value(&store.get_run(&id)?),
        RunsCommand::Channel { channel_id } => {
            let run_id = store.get_run_id_for_channel(&channel_id)?;
            Ok(json!({ "channel_id": channel_id, "run_id": run_id }))
        }
    }
}

fn run_playbooks(command: PlaybooksCommand, store: &SqliteStore) -> Result<Value> {
    match command {
        PlaybooksCommand::List(args) => {
            let options = PlaybookFilterOptions {
                sort: args.sort,
                direction: args.direction,
                search_term: args.search,
                page: args.page,
                per_page: args.per_page,
            };
            to_value(&store.get_playbooks_for_team(
                &args.requester.requester(),
                &args.team,
                &options,
            )?)
        }
    }
}

fn run_kv(command: KvCommand, store: &SqliteStore) -> Result<Value> {
    match command {
        KvCommand::Import { file } => {
            let raw = std::fs::read(&file)
                .with_context(|| format!("failed to read kv import file {}", file.display()))?;
            let entries: serde_json::Map<String, Value> = serde_json::from_slice(&raw)
                .with_context(|| format!("kv import file {} must hold a JSON object", file.display()))?;
            for (key, value) in &entries {
                let encoded = serde_json::to_vec(value)
                    .with_context(|| format!("failed to encode kv value for '{key}'"))?;
                store.set(key, &encoded)?;
            }
            tracing::info!(count = entries.len(), "imported legacy kv entries");
            Ok(json!({ "imported": entries.len() }))
        }
        KvCommand::Migrate => to_value(&store.migrate_kv(store)?),
    }
}

fn to_value(value: &impl Serialize) -> Result<Value> {
    serde_json::to_value(value).map_err(|err| anyhow!("failed to serialize output: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use runbook_core::{classify, Run};
    use runbook_store_sqlite::MigrationState;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn parse(args: &[&str]) -> Command {
        match Cli::try_parse_from(std::iter::once("rb").chain(args.iter().copied())) {
            Ok(cli) => cli.command,
            Err(err) => panic!("failed to parse {args:?}: {err}"),
        }
    }

    fn store() -> SqliteStore {
        let store = must(SqliteStore::open(&StoreConfig::in_memory()));
        must(store.migrate());
        store
    }

    #[test]
    fn list_arguments_map_onto_filter_options() {
        let store = store();
        let mut run = Run {
            name: "horse".to_string(),
            team_id: "team1".to_string(),
            channel_id: "c1".to_string(),
            ..Run::default()
        };
        must(store.create_run(&run));
        run.name = "mouse".to_string();
        run.channel_id = "c2".to_string();
        run.current_status = RunStatus::Finished;
        must(store.create_run(&run));

        let output = must(run_with_store(
            parse(&[
                "runs", "list", "--user", "root", "--admin", "--team", "team1", "--status",
                "reported", "--sort", "name",
            ]),
            &store,
        ));
        assert_eq!(output["total_count"], 1);
        assert_eq!(output["items"][0]["name"], "horse");

        let output = must(run_with_store(
            parse(&[
                "runs", "list", "--user", "root", "--admin", "--team", "team1", "--status",
                "reported", "--status", "finished", "--sort", "name", "--direction", "desc",
            ]),
            &store,
        ));
        assert_eq!(output["items"][0]["name"], "mouse");
    }

    #[test]
    fn bad_sort_surfaces_as_bad_request() {
        let store = store();
        let err = match run_with_store(
            parse(&["runs", "list", "--user", "u", "--sort", "bogus"]),
            &store,
        ) {
            Ok(value) => panic!("expected failure, got {value}"),
            Err(err) => err,
        };
        let class = classify(&err);
        assert_eq!(exit_code(class), 2);
        assert_eq!(
            class.public_message(&err),
            "unsupported sort parameter 'bogus'"
        );
    }

    #[test]
    fn kv_migrate_reports_committed_state() {
        let store = store();
        let output = must(run_with_store(parse(&["kv", "migrate"]), &store));
        assert_eq!(output["state"], "committed");
        assert_eq!(output["runs_migrated"], 0);
        assert_eq!(must(store.migration_state()), MigrationState::Committed);
    }
}

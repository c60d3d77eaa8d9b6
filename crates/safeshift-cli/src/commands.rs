//! Command implementations.

use crate::config::{Args, Command, HistoryArgs, TargetArgs};
use crate::error::CliError;
use crate::formatter::Formatter;
use safeshift_core::backend::{dialect, provider_for_url, Connection, DatabaseKind, SqliteProvider};
use safeshift_core::catalog::Introspector;
use safeshift_core::config::{PlanOptions, SafeshiftConfig};
use safeshift_core::migration::{
    ExitStatus, MigrationError, MigrationExecutor, MigrationPlanner, MigrationStateStore,
    SledStateStore, SqlStateStore,
};
use safeshift_core::safety::SafetyValidator;
use safeshift_core::schema::SchemaSnapshot;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Run the selected command and return the outcome class.
pub fn run(args: &Args, formatter: &Formatter) -> Result<ExitStatus, CliError> {
    let config = args.into_config();
    debug!(environment = %config.environment, command = ?args.command, "running command");

    match &args.command {
        Command::Plan(target) => plan(args, &config, target, formatter),
        Command::Validate(target) => validate(args, &config, target, formatter),
        Command::Execute(execute) => {
            let target = load_target(&execute.target.target)?;
            let mut conn = connect(args)?;
            let executor = executor(args, &config)?;
            let result = executor.migrate(&target, &planner(&config, conn.kind()), conn.as_mut())?;
            println!("{}", formatter.result(&result));
            Ok(ExitStatus::Success)
        }
        Command::RollbackLast(_) => {
            let mut conn = connect(args)?;
            let executor = executor(args, &config)?;
            let result = executor.rollback_last(conn.as_mut())?;
            println!("{}", formatter.result(&result));
            Ok(ExitStatus::Success)
        }
        Command::History(history) => show_history(args, &config, history, formatter),
    }
}

/// Extra output for a failed command, printed before the error line.
pub fn describe_failure(err: &CliError, formatter: &Formatter) -> Option<String> {
    match err {
        CliError::Migration(MigrationError::Blocked { report, .. }) => Some(formatter.report(report)),
        CliError::Migration(migration) => migration.result().map(|r| formatter.result(r)),
        _ => None,
    }
}

fn plan(
    args: &Args,
    config: &SafeshiftConfig,
    target: &TargetArgs,
    formatter: &Formatter,
) -> Result<ExitStatus, CliError> {
    let snapshot = load_target(&target.target)?;
    let mut conn = connect(args)?;
    let kind = conn.kind();
    let current = introspect(config, conn.as_mut())?;

    let plan = planner(config, kind)
        .plan_diff(&current, &snapshot)
        .map_err(MigrationError::from)?;
    let statements = dialect::render_all(kind, &plan.operations, &current)?;
    println!("{}", formatter.plan(&plan, &statements));
    Ok(ExitStatus::Success)
}

fn validate(
    args: &Args,
    config: &SafeshiftConfig,
    target: &TargetArgs,
    formatter: &Formatter,
) -> Result<ExitStatus, CliError> {
    let snapshot = load_target(&target.target)?;
    let mut conn = connect(args)?;
    let kind = conn.kind();
    let current = introspect(config, conn.as_mut())?;

    // Validation reports on every change; confirmation only gates execution.
    let plan = MigrationPlanner::new(PlanOptions::default().allow_destructive().confirm_risky())
        .with_environment(config.environment)
        .for_backend(kind)
        .plan_diff(&current, &snapshot)
        .map_err(MigrationError::from)?;
    let expected = plan.expected_snapshot(&current).map_err(MigrationError::from)?;

    let validator = SafetyValidator::new(config.safety.clone());
    let report = validator.validate_pre(&current, &expected, conn.as_mut());
    println!("{}", formatter.report(&report));

    if report.passes(validator.config()) {
        Ok(ExitStatus::Success)
    } else {
        info!(
            failed_checks = %report.failed_checks().join(","),
            "target schema blocked by safety checks"
        );
        Ok(ExitStatus::Blocked)
    }
}

fn show_history(
    args: &Args,
    config: &SafeshiftConfig,
    history: &HistoryArgs,
    formatter: &Formatter,
) -> Result<ExitStatus, CliError> {
    let store = open_store(args)?;
    let records = store.get_history(&history.filter(config.environment))?;
    println!("{}", formatter.history(&records));
    Ok(ExitStatus::Success)
}

fn connect(args: &Args) -> Result<Box<dyn Connection>, CliError> {
    let url = args.database_url.as_deref().ok_or(CliError::MissingDatabaseUrl)?;
    let provider = provider_for_url(url)?;
    debug!(backend = %provider.kind(), "connecting");
    Ok(provider.connect()?)
}

fn open_store(args: &Args) -> Result<Arc<dyn MigrationStateStore>, CliError> {
    match &args.state_url {
        Some(url) => {
            let shared = match args.database_url.as_deref() {
                Some(database_url) => same_sqlite_file(database_url, url)?,
                None => false,
            };
            if shared {
                return Err(CliError::SharedStateDatabase);
            }
            let conn = provider_for_url(url)?.connect()?;
            Ok(Arc::new(SqlStateStore::open(conn)?))
        }
        None => {
            debug!(path = %args.state.display(), "opening migration journal");
            Ok(Arc::new(SledStateStore::open_path(&args.state)?))
        }
    }
}

/// Whether two URLs name the same SQLite database file.
fn same_sqlite_file(a: &str, b: &str) -> Result<bool, CliError> {
    if DatabaseKind::from_url(a)? != DatabaseKind::Sqlite
        || DatabaseKind::from_url(b)? != DatabaseKind::Sqlite
    {
        return Ok(false);
    }
    Ok(sqlite_file(a) == sqlite_file(b))
}

fn sqlite_file(url: &str) -> PathBuf {
    let path = SqliteProvider::from_url(url).path().to_path_buf();
    if let Ok(resolved) = std::fs::canonicalize(&path) {
        return resolved;
    }
    let absolute = std::env::current_dir()
        .map(|dir| dir.join(&path))
        .unwrap_or(path);
    absolute
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn executor(args: &Args, config: &SafeshiftConfig) -> Result<MigrationExecutor, CliError> {
    let store = open_store(args)?;
    Ok(MigrationExecutor::new(store, config.execution.clone())
        .with_validator(SafetyValidator::new(config.safety.clone())))
}

fn planner(config: &SafeshiftConfig, kind: DatabaseKind) -> MigrationPlanner {
    MigrationPlanner::new(config.plan)
        .with_environment(config.environment)
        .for_backend(kind)
}

fn introspect(config: &SafeshiftConfig, conn: &mut dyn Connection) -> Result<SchemaSnapshot, CliError> {
    let snapshot = Introspector::new()
        .with_schema(config.execution.namespace.clone())
        .introspect(conn)
        .map_err(MigrationError::from)?;
    Ok(snapshot)
}

fn load_target(path: &Path) -> Result<SchemaSnapshot, CliError> {
    let json = std::fs::read_to_string(path).map_err(|source| CliError::ReadTarget {
        path: path.to_path_buf(),
        source,
    })?;
    SchemaSnapshot::from_json(&json).map_err(|source| CliError::ParseTarget {
        path: path.to_path_buf(),
        source,
    })
}

//! Command-line arguments.

use crate::formatter::OutputFormat;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use safeshift_core::config::{Environment, PlanOptions, SafeshiftConfig};
use safeshift_core::migration::{HistoryFilter, MigrationStatus};
use std::path::PathBuf;
use std::time::Duration;

/// Default directory of the local migration journal.
pub const DEFAULT_STATE_DIR: &str = ".safeshift";

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable.
    Text,
    /// One JSON object per line.
    Json,
}

/// Safe schema migrations for PostgreSQL and SQLite.
#[derive(Parser, Debug)]
#[command(name = "safeshift")]
#[command(version, about = "Safe schema migrations for PostgreSQL and SQLite", long_about = None)]
pub struct Args {
    /// Database to migrate (postgres://... or a SQLite path).
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Deployment environment; selects safety defaults.
    #[arg(short, long, default_value = "development", global = true)]
    pub environment: Environment,

    /// Directory of the local migration journal.
    #[arg(long, default_value = DEFAULT_STATE_DIR, global = true)]
    pub state: PathBuf,

    /// Keep migration records in this database instead of the local
    /// journal. Must not be the SQLite file being migrated.
    #[arg(long, env = "SAFESHIFT_STATE_URL", global = true)]
    pub state_url: Option<String>,

    /// Output format.
    #[arg(long, default_value = "table", value_enum, global = true)]
    pub format: OutputFormat,

    /// Log format.
    #[arg(long, default_value = "text", value_enum, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the plan to reach a target schema without changing anything.
    Plan(TargetArgs),
    /// Run the safety checks for a target schema.
    Validate(TargetArgs),
    /// Plan, validate and apply a target schema.
    Execute(ExecuteArgs),
    /// Undo the most recently applied migration.
    RollbackLast(LockArgs),
    /// List recorded migrations.
    History(HistoryArgs),
}

/// Target snapshot and confirmation flags.
#[derive(ClapArgs, Debug, Clone)]
pub struct TargetArgs {
    /// Target schema snapshot (JSON).
    #[arg(long)]
    pub target: PathBuf,

    /// Allow operations that lose data.
    #[arg(long)]
    pub allow_destructive: bool,

    /// Accept operations that may fail on existing data.
    #[arg(long)]
    pub confirm: bool,
}

/// Lock settings.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct LockArgs {
    /// Seconds to wait for the migration lock.
    #[arg(long)]
    pub lock_timeout: Option<u64>,

    /// Schema namespace the lock is scoped to.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Developer recorded with the migration.
    #[arg(long, env = "SAFESHIFT_DEVELOPER")]
    pub developer: Option<String>,
}

/// Options for `execute`.
#[derive(ClapArgs, Debug, Clone)]
pub struct ExecuteArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub lock: LockArgs,

    /// Abort and roll back when the run takes longer than this many seconds.
    #[arg(long)]
    pub deadline: Option<u64>,

    /// Render and log the DDL without applying it.
    #[arg(long)]
    pub dry_run: bool,
}

/// Filters for `history`.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct HistoryArgs {
    /// Only records with this status.
    #[arg(long)]
    pub status: Option<MigrationStatus>,

    /// Only records touching this table.
    #[arg(long)]
    pub table: Option<String>,

    /// Only records from the selected environment.
    #[arg(long)]
    pub this_environment: bool,

    /// Maximum number of records.
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

impl Args {
    /// Build the run configuration from the arguments.
    pub fn into_config(&self) -> SafeshiftConfig {
        let mut config = SafeshiftConfig::for_environment(self.environment);
        match &self.command {
            Command::Plan(target) | Command::Validate(target) => {
                config.plan = target.plan_options(config.plan);
            }
            Command::Execute(execute) => {
                config.plan = execute.target.plan_options(config.plan);
                execute.lock.apply(&mut config);
                if let Some(secs) = execute.deadline {
                    config.execution.deadline = Some(Duration::from_secs(secs));
                }
                config.execution.dry_run = execute.dry_run;
            }
            Command::RollbackLast(lock) => lock.apply(&mut config),
            Command::History(_) => {}
        }
        config
    }
}

impl TargetArgs {
    fn plan_options(&self, defaults: PlanOptions) -> PlanOptions {
        PlanOptions {
            allow_destructive: defaults.allow_destructive || self.allow_destructive,
            confirm_risky: defaults.confirm_risky || self.confirm,
        }
    }
}

impl LockArgs {
    fn apply(&self, config: &mut SafeshiftConfig) {
        if let Some(secs) = self.lock_timeout {
            config.execution.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(namespace) = &self.namespace {
            config.execution.namespace = namespace.clone();
        }
        if let Some(developer) = &self.developer {
            config.execution.developer_id = Some(developer.clone());
        }
    }
}

impl HistoryArgs {
    /// History filter for these arguments.
    pub fn filter(&self, environment: Environment) -> HistoryFilter {
        let mut filter = HistoryFilter::all().with_limit(self.limit);
        if let Some(status) = self.status {
            filter = filter.with_status(status);
        }
        if let Some(table) = &self.table {
            filter = filter.with_table(table.clone());
        }
        if self.this_environment {
            filter = filter.with_environment(environment);
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_flags_reach_config() {
        let args = Args::try_parse_from([
            "safeshift",
            "--database-url",
            "app.db",
            "--environment",
            "prod",
            "execute",
            "--target",
            "target.json",
            "--allow-destructive",
            "--lock-timeout",
            "7",
            "--deadline",
            "120",
        ])
        .unwrap();
        let config = args.into_config();

        assert_eq!(config.environment, Environment::Production);
        assert!(config.plan.allow_destructive);
        assert!(!config.plan.confirm_risky);
        assert_eq!(config.execution.lock_timeout, Duration::from_secs(7));
        assert_eq!(config.execution.deadline, Some(Duration::from_secs(120)));
        assert!(config.safety.revalidate_after_lock);
        assert!(!config.execution.dry_run);
    }

    #[test]
    fn test_history_filter() {
        let args = Args::try_parse_from([
            "safeshift",
            "history",
            "--status",
            "rolled_back",
            "--table",
            "users",
            "--limit",
            "5",
        ])
        .unwrap();
        let Command::History(history) = &args.command else {
            panic!("expected history");
        };
        let filter = history.filter(args.environment);
        assert_eq!(filter.status, Some(MigrationStatus::RolledBack));
        assert_eq!(filter.table.as_deref(), Some("users"));
        assert_eq!(filter.limit, Some(5));
        assert_eq!(filter.environment, None);
    }

    #[test]
    fn test_unknown_environment_is_rejected() {
        assert!(Args::try_parse_from(["safeshift", "--environment", "qa", "history"]).is_err());
    }
}

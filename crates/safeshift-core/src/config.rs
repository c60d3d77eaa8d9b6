//! Configuration for planning, validation and execution.
//!
//! Defaults depend on the [`Environment`]: development favours speed,
//! production favours strictness.

use crate::safety::Severity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default lock namespace when none is configured.
pub const DEFAULT_NAMESPACE: &str = "public";

/// Default lock lease in seconds.
pub const DEFAULT_LOCK_LEASE_SECS: u64 = 600;

/// Default interval between lock attempts in milliseconds.
pub const DEFAULT_LOCK_POLL_MS: u64 = 100;

/// Default per-check time budget in seconds.
pub const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 30;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Local development.
    #[default]
    Development,
    /// Pre-production.
    Staging,
    /// Production.
    Production,
}

impl Environment {
    /// Default migration lock timeout.
    pub fn default_lock_timeout(self) -> Duration {
        match self {
            Environment::Development => Duration::from_secs(5),
            Environment::Staging => Duration::from_secs(30),
            Environment::Production => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment: {}", other)),
        }
    }
}

/// Which checks run and what blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyValidationConfig {
    /// Run checks before touching the database.
    pub pre_validate: bool,
    /// Run checks after commit.
    pub post_validate: bool,
    /// Lowest failing severity that blocks.
    pub block_threshold: Severity,
    /// Time budget for one check. A check that overruns is reported as failed.
    pub check_timeout: Duration,
    /// Checks to run; `None` runs all of them.
    pub enabled_checks: Option<BTreeSet<String>>,
    /// Checks whose failures are reported but do not block. Never applies to
    /// CRITICAL failures.
    pub overridden_checks: BTreeSet<String>,
    /// Validate again once the migration lock is held.
    pub revalidate_after_lock: bool,
}

impl Default for SafetyValidationConfig {
    fn default() -> Self {
        Self {
            pre_validate: true,
            post_validate: true,
            block_threshold: Severity::High,
            check_timeout: Duration::from_secs(DEFAULT_CHECK_TIMEOUT_SECS),
            enabled_checks: None,
            overridden_checks: BTreeSet::new(),
            revalidate_after_lock: false,
        }
    }
}

impl SafetyValidationConfig {
    /// Defaults for an environment.
    pub fn for_environment(environment: Environment) -> Self {
        let base = Self::default();
        match environment {
            Environment::Development => Self {
                block_threshold: Severity::Critical,
                ..base
            },
            Environment::Staging => base,
            Environment::Production => Self {
                revalidate_after_lock: true,
                ..base
            },
        }
    }

    /// Set the blocking threshold.
    pub fn with_block_threshold(mut self, severity: Severity) -> Self {
        self.block_threshold = severity;
        self
    }

    /// Skip pre-validation.
    pub fn without_pre_validation(mut self) -> Self {
        self.pre_validate = false;
        self
    }

    /// Skip post-validation.
    pub fn without_post_validation(mut self) -> Self {
        self.post_validate = false;
        self
    }

    /// Run only the named checks.
    pub fn with_enabled_checks<I, S>(mut self, checks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_checks = Some(checks.into_iter().map(Into::into).collect());
        self
    }

    /// Let a check's non-critical failures through.
    pub fn with_override(mut self, check: impl Into<String>) -> Self {
        self.overridden_checks.insert(check.into());
        self
    }

    /// Whether a check should run.
    pub fn is_enabled(&self, check: &str) -> bool {
        self.enabled_checks
            .as_ref()
            .map_or(true, |enabled| enabled.contains(check))
    }
}

/// Permissions for risky operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Allow operations graded destructive.
    pub allow_destructive: bool,
    /// Accept operations that require confirmation.
    pub confirm_risky: bool,
}

impl PlanOptions {
    /// Defaults for an environment. Development auto-confirms risky changes.
    pub fn for_environment(environment: Environment) -> Self {
        Self {
            allow_destructive: false,
            confirm_risky: environment == Environment::Development,
        }
    }

    /// Allow destructive operations.
    pub fn allow_destructive(mut self) -> Self {
        self.allow_destructive = true;
        self
    }

    /// Confirm risky operations.
    pub fn confirm_risky(mut self) -> Self {
        self.confirm_risky = true;
        self
    }
}

/// Execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Environment tag recorded with each migration.
    pub environment: Environment,
    /// Schema namespace the migration lock is scoped to.
    pub namespace: String,
    /// How long to wait for the migration lock.
    pub lock_timeout: Duration,
    /// Lease on the lock row for backends without advisory locks.
    pub lock_lease: Duration,
    /// Pause between lock attempts.
    pub lock_poll_interval: Duration,
    /// Overall deadline for one execution.
    pub deadline: Option<Duration>,
    /// Developer recorded with each migration.
    pub developer_id: Option<String>,
    /// Render DDL without applying it.
    pub dry_run: bool,
    /// Refuse to run while conflicting plans are recorded.
    pub fail_on_conflict: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::for_environment(Environment::Development)
    }
}

impl ExecutionConfig {
    /// Defaults for an environment.
    pub fn for_environment(environment: Environment) -> Self {
        Self {
            environment,
            namespace: DEFAULT_NAMESPACE.to_string(),
            lock_timeout: environment.default_lock_timeout(),
            lock_lease: Duration::from_secs(DEFAULT_LOCK_LEASE_SECS),
            lock_poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_MS),
            deadline: None,
            developer_id: None,
            dry_run: false,
            fail_on_conflict: environment == Environment::Production,
        }
    }

    /// Set the lock namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the lock poll interval.
    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    /// Set an overall deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the developer id.
    pub fn with_developer(mut self, developer: impl Into<String>) -> Self {
        self.developer_id = Some(developer.into());
        self
    }

    /// Render only.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Fail when conflicting records exist.
    pub fn with_fail_on_conflict(mut self, fail: bool) -> Self {
        self.fail_on_conflict = fail;
        self
    }
}

/// Everything one run needs, bundled per environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafeshiftConfig {
    /// Environment.
    pub environment: Environment,
    /// Planner permissions.
    pub plan: PlanOptions,
    /// Safety checks.
    pub safety: SafetyValidationConfig,
    /// Execution.
    pub execution: ExecutionConfig,
}

impl SafeshiftConfig {
    /// Defaults for an environment.
    pub fn for_environment(environment: Environment) -> Self {
        Self {
            environment,
            plan: PlanOptions::for_environment(environment),
            safety: SafetyValidationConfig::for_environment(environment),
            execution: ExecutionConfig::for_environment(environment),
        }
    }
}

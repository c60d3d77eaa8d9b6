//! Safety check results and reports.

use crate::catalog::Evidence;
use crate::config::SafetyValidationConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Severity of a failed check, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Style or best-practice issue.
    Low,
    /// Degraded but functional.
    Medium,
    /// Broken consumer; blocks unless overridden.
    High,
    /// Broken integrity; always blocks.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// What a check's verdict rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckBasis {
    /// Structural facts read from the catalog.
    Catalog,
    /// Text matching over definitions; advisory, capped at HIGH.
    Heuristic,
}

/// Which validation pass produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPhase {
    /// Before execution.
    Pre,
    /// After commit.
    Post,
    /// Standalone run.
    Standalone,
}

impl fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationPhase::Pre => write!(f, "pre"),
            ValidationPhase::Post => write!(f, "post"),
            ValidationPhase::Standalone => write!(f, "standalone"),
        }
    }
}

/// What a check found, before it is turned into a result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Findings {
    /// Problems that fail the check.
    pub violations: Vec<String>,
    /// Observations that do not fail the check.
    pub warnings: Vec<String>,
    /// Objects named by the violations.
    pub affected_objects: Vec<String>,
}

impl Findings {
    /// Record a violation against an object.
    pub fn violation(&mut self, object: impl Into<String>, message: impl Into<String>) {
        let object = object.into();
        if !self.affected_objects.contains(&object) {
            self.affected_objects.push(object);
        }
        self.violations.push(message.into());
    }

    /// Record a warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Whether nothing failed.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Outcome of one safety check.
///
/// A result can only pass if it carries [`Evidence`] of at least one catalog
/// query, and evidence can only be produced by a catalog reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyCheckResult {
    /// Check name.
    pub check_name: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Severity of the failure (the check's class when it passed).
    pub severity: Severity,
    /// Summary line.
    pub message: String,
    /// Problems found.
    pub violations: Vec<String>,
    /// Non-failing observations.
    pub warnings: Vec<String>,
    /// Objects involved in the violations.
    pub affected_objects: Vec<String>,
    /// Catalog queries the check ran.
    pub evidence: Vec<Evidence>,
    /// Wall time spent.
    pub execution_time: Duration,
    /// What the verdict rests on.
    pub basis: CheckBasis,
}

impl SafetyCheckResult {
    /// Build a result from a check's findings.
    pub fn from_findings(
        check_name: impl Into<String>,
        severity: Severity,
        basis: CheckBasis,
        findings: Findings,
        evidence: Vec<Evidence>,
        execution_time: Duration,
    ) -> Self {
        let check_name = check_name.into();
        let severity = match basis {
            CheckBasis::Heuristic => severity.min(Severity::High),
            CheckBasis::Catalog => severity,
        };
        let Findings {
            mut violations,
            warnings,
            affected_objects,
        } = findings;

        if violations.is_empty() && evidence.is_empty() {
            violations.push("check ran no catalog query".to_string());
        }
        let passed = violations.is_empty();
        let message = if passed {
            format!("{} passed", check_name)
        } else if violations.len() == 1 {
            violations[0].clone()
        } else {
            format!("{} violations found", violations.len())
        };

        Self {
            check_name,
            passed,
            severity,
            message,
            violations,
            warnings,
            affected_objects,
            evidence,
            execution_time,
            basis,
        }
    }

    /// Result for a check that could not complete.
    pub fn errored(
        check_name: impl Into<String>,
        error: &dyn fmt::Display,
        evidence: Vec<Evidence>,
        execution_time: Duration,
    ) -> Self {
        let detail = error.to_string();
        Self {
            check_name: check_name.into(),
            passed: false,
            severity: Severity::Critical,
            message: "validation error".to_string(),
            violations: vec![detail],
            warnings: Vec::new(),
            affected_objects: Vec::new(),
            evidence,
            execution_time,
            basis: CheckBasis::Catalog,
        }
    }

    /// Whether this result blocks under `config`.
    pub fn blocks(&self, config: &SafetyValidationConfig) -> bool {
        if self.passed || self.severity < config.block_threshold {
            return false;
        }
        self.severity == Severity::Critical || !config.overridden_checks.contains(&self.check_name)
    }
}

/// Results of one validation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyReport {
    /// Which pass produced the report.
    pub phase: ValidationPhase,
    /// One result per check that ran.
    pub results: Vec<SafetyCheckResult>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Total wall time.
    pub elapsed: Duration,
}

impl SafetyReport {
    /// Empty report.
    pub fn new(phase: ValidationPhase) -> Self {
        Self {
            phase,
            results: Vec::new(),
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
        }
    }

    /// Append a result.
    pub fn push(&mut self, result: SafetyCheckResult) {
        self.results.push(result);
    }

    /// Whether nothing blocks under `config`.
    pub fn passes(&self, config: &SafetyValidationConfig) -> bool {
        self.blocking(config).is_empty()
    }

    /// Results that block under `config`.
    pub fn blocking(&self, config: &SafetyValidationConfig) -> Vec<&SafetyCheckResult> {
        self.results.iter().filter(|r| r.blocks(config)).collect()
    }

    /// Failed results at or above `severity`.
    pub fn failures_at_least(&self, severity: Severity) -> Vec<&SafetyCheckResult> {
        self.results
            .iter()
            .filter(|r| !r.passed && r.severity >= severity)
            .collect()
    }

    /// Whether any check failed with CRITICAL severity.
    pub fn has_critical(&self) -> bool {
        !self.failures_at_least(Severity::Critical).is_empty()
    }

    /// Names of failed checks.
    pub fn failed_checks(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.check_name.clone())
            .collect()
    }

    /// Objects named by failed checks, deduplicated in order.
    pub fn affected_objects(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for object in self
            .results
            .iter()
            .filter(|r| !r.passed)
            .flat_map(|r| r.affected_objects.iter())
        {
            if !out.contains(object) {
                out.push(object.clone());
            }
        }
        out
    }

    /// Result for a named check.
    pub fn result(&self, check_name: &str) -> Option<&SafetyCheckResult> {
        self.results.iter().find(|r| r.check_name == check_name)
    }
}

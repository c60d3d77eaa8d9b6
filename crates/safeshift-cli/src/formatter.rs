//! Output formatters for plans, reports and history.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use safeshift_core::migration::{MigrationPlan, MigrationRecord, MigrationResult};
use safeshift_core::safety::SafetyReport;
use serde::Serialize;

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Renders command output in one format.
pub struct Formatter {
    format: OutputFormat,
}

impl Formatter {
    /// Formatter for `format`.
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// A plan with the DDL it would run.
    pub fn plan(&self, plan: &MigrationPlan, statements: &[String]) -> String {
        match self.format {
            OutputFormat::Json => json(&PlanOutput { plan, statements }),
            OutputFormat::Table => plan_table(plan, statements),
        }
    }

    /// A safety report.
    pub fn report(&self, report: &SafetyReport) -> String {
        match self.format {
            OutputFormat::Json => json(report),
            OutputFormat::Table => report_table(report),
        }
    }

    /// The outcome of a run.
    pub fn result(&self, result: &MigrationResult) -> String {
        match self.format {
            OutputFormat::Json => json(result),
            OutputFormat::Table => result_summary(result),
        }
    }

    /// Recorded migrations.
    pub fn history(&self, records: &[MigrationRecord]) -> String {
        match self.format {
            OutputFormat::Json => json(&records),
            OutputFormat::Table => history_table(records),
        }
    }
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    plan: &'a MigrationPlan,
    statements: &'a [String],
}

fn json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

fn plan_table(plan: &MigrationPlan, statements: &[String]) -> String {
    if plan.is_empty() {
        return "Schema is up to date".to_string();
    }

    let mut table = Table::new();
    table.set_header(vec!["#", "Operation", "Tier", "Reason"]);
    for (index, op) in plan.operations.iter().enumerate() {
        let grade = plan.compatibility.grades.iter().find(|g| g.index == index);
        table.add_row(vec![
            Cell::new(index + 1),
            Cell::new(op.describe()),
            Cell::new(grade.map(|g| g.tier.to_string()).unwrap_or_default()),
            Cell::new(grade.map(|g| g.reasoning.as_str()).unwrap_or_default()),
        ]);
    }

    let mut output = format!(
        "Plan {} ({} operation(s), {})\n{}",
        plan.version,
        plan.len(),
        plan.metadata.tier,
        table
    );
    if !statements.is_empty() {
        output.push_str("\n\nDDL:\n");
        for statement in statements {
            output.push_str(statement);
            output.push_str(";\n");
        }
    }
    output.push_str(&format!("\nRollback: {} operation(s)", plan.rollback.len()));
    for warning in &plan.compatibility.warnings {
        output.push_str(&format!("\nwarning: {}", warning));
    }
    output
}

fn report_table(report: &SafetyReport) -> String {
    let mut table = Table::new();
    table.set_header(vec!["Check", "Result", "Severity", "Objects", "Details"]);
    for result in &report.results {
        let details = if result.violations.is_empty() {
            result.message.clone()
        } else {
            result.violations.join("\n")
        };
        table.add_row(vec![
            Cell::new(&result.check_name),
            Cell::new(if result.passed { "pass" } else { "FAIL" }),
            Cell::new(result.severity),
            Cell::new(result.affected_objects.join(", ")),
            Cell::new(details),
        ]);
    }
    format!("{} validation\n{}", report.phase, table)
}

fn result_summary(result: &MigrationResult) -> String {
    let mut output = if result.dry_run {
        format!("Dry run of {}: nothing applied", result.version)
    } else {
        format!(
            "Migration {}: {} ({} of {} step(s), {:.2}s)",
            result.version,
            result.phase,
            result.steps_completed,
            result.plan.len(),
            result.elapsed.as_secs_f64()
        )
    };
    if result.dry_run && !result.statements.is_empty() {
        output.push_str("\n\nDDL:\n");
        for statement in &result.statements {
            output.push_str(statement);
            output.push_str(";\n");
        }
    }
    if !result.affected_objects.is_empty() {
        output.push_str(&format!("\nAffected: {}", result.affected_objects.join(", ")));
    }
    if let Some(message) = &result.error_message {
        output.push_str(&format!("\nError: {}", message));
    }
    if result.manual_intervention_required {
        output.push_str("\nManual intervention required: inspect the database before retrying");
    }
    if let Some(report) = result.safety_report.as_ref().filter(|r| !r.failed_checks().is_empty()) {
        output.push_str("\n\n");
        output.push_str(&report_table(report));
    }
    output
}

fn history_table(records: &[MigrationRecord]) -> String {
    if records.is_empty() {
        return "No migrations recorded".to_string();
    }

    let mut table = Table::new();
    table.set_header(vec![
        "Version",
        "Name",
        "Status",
        "Environment",
        "Tables",
        "Applied",
        "Duration",
        "Error",
    ]);
    for record in records {
        table.add_row(vec![
            Cell::new(&record.version),
            Cell::new(&record.name),
            Cell::new(record.status),
            Cell::new(record.environment),
            Cell::new(record.tables.join(", ")),
            Cell::new(
                record
                    .applied_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(
                record
                    .execution_time_seconds
                    .map(|s| format!("{:.2}s", s))
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(record.error_message.as_deref().unwrap_or("")),
        ]);
    }
    format!("{}\n({} migration(s))", table, records.len())
}

//! Migration planning.
//!
//! Turns a list of operations into an executable [`MigrationPlan`]:
//!
//! 1. Foreign keys between tables created together are split out into
//!    separate `AddConstraint` operations, and cyclic foreign keys between
//!    tables dropped together into `DropConstraint` operations.
//! 2. Operations are ordered topologically over their dependencies. Ties
//!    are broken by operation priority, then table name, then input
//!    position, so the same input always yields the same order.
//! 3. The ordered operations are applied to a copy of the current schema.
//!    Drops are refreshed with the definition they remove, and each step's
//!    inverse is recorded. The reversed inverses form the rollback plan.
//! 4. The plan is graded and gated on the caller's confirmation flags.

use super::compat::{grade_operations, CompatibilityReport, CompatibilityTier};
use super::diff::SchemaDiffer;
use super::error::PlanningError;
use super::operation::SchemaOperation;
use super::state::MigrationRecord;
use crate::backend::DatabaseKind;
use crate::config::{Environment, PlanOptions};
use crate::schema::{normalize_ident, ConstraintDef, DanglingReference, SchemaSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use tracing::{debug, info};

const CYCLE_SUGGESTION: &str = "rename through an intermediate name or split into two runs";

const DESTRUCTIVE_HINT: &str = "re-run with --allow-destructive once the data loss is acceptable, \
     or keep the data by adding a new column or table and copying into it";

const CONFIRM_HINT: &str =
    "re-run with --confirm after checking that existing rows satisfy the change";

/// Operations that undo a migration, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollbackPlan {
    /// Inverse operations.
    pub operations: Vec<SchemaOperation>,
}

impl RollbackPlan {
    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether there is nothing to undo.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// The last `count` operations, which undo the first `count` forward
    /// steps.
    pub fn undo_first(&self, count: usize) -> &[SchemaOperation] {
        let start = self.operations.len().saturating_sub(count);
        &self.operations[start..]
    }
}

/// How and from what a plan was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    /// Checksum of the schema the plan was built on.
    pub source_checksum: String,
    /// Checksum of the schema the plan produces.
    pub target_checksum: String,
    /// When the plan was built.
    pub generated_at: DateTime<Utc>,
    /// Environment the plan was built for.
    pub environment: Environment,
    /// Overall compatibility tier.
    pub tier: CompatibilityTier,
    /// Whether destructive operations were allowed.
    pub allow_destructive: bool,
    /// Whether risky operations were confirmed.
    pub confirmed: bool,
}

/// An ordered, graded migration with its rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Content-derived version.
    pub version: String,
    /// Human name.
    pub name: String,
    /// Operations in execution order.
    pub operations: Vec<SchemaOperation>,
    /// Operations that undo this plan.
    pub rollback: RollbackPlan,
    /// Per-operation grades.
    pub compatibility: CompatibilityReport,
    /// Provenance.
    pub metadata: PlanMetadata,
}

impl MigrationPlan {
    /// Number of forward operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the plan does nothing.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Rename the plan. The version is unchanged.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Checksum of the forward operations.
    pub fn checksum(&self) -> String {
        operations_checksum(&self.operations)
    }

    /// Every table the plan touches, normalised.
    pub fn touched_tables(&self) -> BTreeSet<String> {
        self.operations
            .iter()
            .flat_map(|op| op.touched_tables())
            .collect()
    }

    /// The schema `current` becomes once the plan is applied.
    pub fn expected_snapshot(&self, current: &SchemaSnapshot) -> Result<SchemaSnapshot, PlanningError> {
        let mut expected = current.clone();
        expected
            .apply_all(&self.operations)
            .map_err(|e| PlanningError::Stale {
                reason: e.to_string(),
            })?;
        Ok(expected)
    }

    /// Pretty JSON.
    pub fn to_json(&self) -> Result<String, PlanningError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a plan written by [`to_json`](Self::to_json).
    pub fn from_json(json: &str) -> Result<Self, PlanningError> {
        Ok(serde_json::from_str(json)?)
    }
}

fn operations_checksum(operations: &[SchemaOperation]) -> String {
    let bytes = serde_json::to_vec(operations).unwrap_or_default();
    hex::encode(blake3::hash(&bytes).as_bytes())
}

fn plan_version(source_checksum: &str, operations: &[SchemaOperation]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source_checksum.as_bytes());
    hasher.update(&serde_json::to_vec(operations).unwrap_or_default());
    let mut version = hex::encode(hasher.finalize().as_bytes());
    version.truncate(16);
    version
}

/// Build a plan from `current` to `target` with `options`.
pub fn plan_migration(
    current: &SchemaSnapshot,
    target: &SchemaSnapshot,
    options: PlanOptions,
) -> Result<MigrationPlan, PlanningError> {
    MigrationPlanner::new(options).plan_diff(current, target)
}

/// Migration planner.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlanner {
    options: PlanOptions,
    environment: Environment,
    kind: Option<DatabaseKind>,
}

impl MigrationPlanner {
    /// Planner with the given confirmation flags.
    pub fn new(options: PlanOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Record the target environment in plan metadata.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Grade type changes with a backend's rules.
    pub fn for_backend(mut self, kind: DatabaseKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Plan the change from `current` to `target`.
    pub fn plan_diff(
        &self,
        current: &SchemaSnapshot,
        target: &SchemaSnapshot,
    ) -> Result<MigrationPlan, PlanningError> {
        let differ = match self.kind {
            Some(kind) => SchemaDiffer::for_backend(kind),
            None => SchemaDiffer::new(),
        };
        self.plan(differ.operations(current, target), current)
    }

    /// Order, simulate, grade and gate `operations` against `current`.
    pub fn plan(
        &self,
        operations: Vec<SchemaOperation>,
        current: &SchemaSnapshot,
    ) -> Result<MigrationPlan, PlanningError> {
        let split = split_foreign_keys(operations);
        let ordered = order_operations(split)?;
        self.finish(ordered, current, None)
    }

    /// Plan the undo of a recorded migration. The stored rollback
    /// operations are used in their recorded order.
    pub fn plan_rollback(
        &self,
        record: &MigrationRecord,
        current: &SchemaSnapshot,
    ) -> Result<MigrationPlan, PlanningError> {
        if record.rollback_plan.is_empty() {
            return Err(PlanningError::NothingToRollBack);
        }
        let mut plan = self.finish(
            record.rollback_plan.operations.clone(),
            current,
            Some(format!("{}-rollback", record.version)),
        )?;
        plan.name = format!("rollback of {}", record.name);
        Ok(plan)
    }

    fn finish(
        &self,
        ordered: Vec<SchemaOperation>,
        current: &SchemaSnapshot,
        version: Option<String>,
    ) -> Result<MigrationPlan, PlanningError> {
        let simulation = simulate(ordered, current)?;

        let existing: HashSet<(String, String)> = current
            .dangling_references()
            .into_iter()
            .map(|d| (normalize_ident(&d.table), d.constraint))
            .collect();
        let introduced: Vec<DanglingReference> = simulation
            .expected
            .dangling_references()
            .into_iter()
            .filter(|d| !existing.contains(&(normalize_ident(&d.table), d.constraint.clone())))
            .collect();
        if !introduced.is_empty() {
            return Err(PlanningError::DanglingReferences {
                references: introduced,
            });
        }

        let compatibility = grade_operations(self.kind, &simulation.forward);
        self.gate(&compatibility)?;

        let source_checksum = current.checksum();
        let version = version.unwrap_or_else(|| plan_version(&source_checksum, &simulation.forward));
        let plan = MigrationPlan {
            name: format!("migration {}", version),
            version,
            metadata: PlanMetadata {
                source_checksum,
                target_checksum: simulation.expected.checksum(),
                generated_at: Utc::now(),
                environment: self.environment,
                tier: compatibility.overall,
                allow_destructive: self.options.allow_destructive,
                confirmed: self.options.confirm_risky,
            },
            operations: simulation.forward,
            rollback: RollbackPlan {
                operations: simulation.inverse,
            },
            compatibility,
        };

        info!(
            event = "migration.planned",
            version = %plan.version,
            operations = plan.operations.len(),
            tier = %plan.metadata.tier,
            environment = %plan.metadata.environment,
            "migration planned"
        );
        Ok(plan)
    }

    fn gate(&self, report: &CompatibilityReport) -> Result<(), PlanningError> {
        let named = |tier: CompatibilityTier, ops: &CompatibilityReport| -> Vec<String> {
            ops.grades
                .iter()
                .filter(|g| g.tier == tier)
                .map(|g| g.description.clone())
                .collect()
        };

        let destructive = named(CompatibilityTier::Destructive, report);
        if !destructive.is_empty() && !self.options.allow_destructive {
            return Err(PlanningError::ConfirmationRequired {
                tier: CompatibilityTier::Destructive,
                operations: destructive,
                hint: DESTRUCTIVE_HINT.to_string(),
            });
        }

        let risky = named(CompatibilityTier::RequiresConfirmation, report);
        if !risky.is_empty() && !self.options.confirm_risky {
            return Err(PlanningError::ConfirmationRequired {
                tier: CompatibilityTier::RequiresConfirmation,
                operations: risky,
                hint: CONFIRM_HINT.to_string(),
            });
        }
        Ok(())
    }
}

/// Move foreign keys out of table definitions where keeping them inline
/// would force an impossible order.
///
/// Every foreign key between two tables created together becomes an
/// `AddConstraint`. A foreign key between two tables dropped together
/// becomes a `DropConstraint` when the referenced table also reaches back
/// to the referencing one. Self-references stay inline.
pub fn split_foreign_keys(operations: Vec<SchemaOperation>) -> Vec<SchemaOperation> {
    let mut created = HashSet::new();
    let mut drop_graph: HashMap<String, Vec<String>> = HashMap::new();
    for op in &operations {
        match op {
            SchemaOperation::CreateTable { table } => {
                created.insert(table.key());
            }
            SchemaOperation::DropTable { table } => {
                drop_graph.insert(table.key(), table.referenced_tables());
            }
            _ => {}
        }
    }

    let mut out = Vec::with_capacity(operations.len());
    let mut extra = Vec::new();
    for op in operations {
        match op {
            SchemaOperation::CreateTable { mut table } => {
                let key = table.key();
                let (deferred, kept): (Vec<ConstraintDef>, Vec<ConstraintDef>) =
                    table.constraints.into_iter().partition(|c| {
                        c.referenced_table()
                            .map(normalize_ident)
                            .is_some_and(|r| r != key && created.contains(&r))
                    });
                table.constraints = kept;
                for constraint in deferred {
                    extra.push(SchemaOperation::AddConstraint {
                        table: table.name.clone(),
                        constraint,
                    });
                }
                out.push(SchemaOperation::CreateTable { table });
            }
            SchemaOperation::DropTable { mut table } => {
                let key = table.key();
                let (split, kept): (Vec<ConstraintDef>, Vec<ConstraintDef>) =
                    table.constraints.into_iter().partition(|c| {
                        c.referenced_table()
                            .map(normalize_ident)
                            .is_some_and(|r| r != key && reaches(&drop_graph, &r, &key))
                    });
                table.constraints = kept;
                for constraint in split {
                    extra.push(SchemaOperation::DropConstraint {
                        table: table.name.clone(),
                        constraint,
                    });
                }
                out.push(SchemaOperation::DropTable { table });
            }
            other => out.push(other),
        }
    }
    out.extend(extra);
    out
}

/// Whether `from` reaches `to` over foreign keys in `graph`.
fn reaches(graph: &HashMap<String, Vec<String>>, from: &str, to: &str) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![from.to_string()];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        if let Some(next) = graph.get(&node) {
            stack.extend(next.iter().cloned());
        }
    }
    false
}

/// Order operations so every operation runs after the ones it depends on.
pub fn order_operations(operations: Vec<SchemaOperation>) -> Result<Vec<SchemaOperation>, PlanningError> {
    let n = operations.len();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];

    for (a, first) in operations.iter().enumerate() {
        for (b, second) in operations.iter().enumerate() {
            if a != b && must_precede(first, second) {
                successors[a].push(b);
                in_degree[b] += 1;
            }
        }
    }

    let sort_key = |i: usize| {
        let op = &operations[i];
        Reverse((op.kind().priority(), op.table_key(), i))
    };
    let mut ready: BinaryHeap<_> = (0..n).filter(|&i| in_degree[i] == 0).map(sort_key).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, _, i))) = ready.pop() {
        order.push(i);
        for &next in &successors[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(sort_key(next));
            }
        }
    }

    if order.len() < n {
        let placed: HashSet<usize> = order.iter().copied().collect();
        let stuck = (0..n)
            .filter(|i| !placed.contains(i))
            .map(|i| operations[i].describe())
            .collect();
        return Err(PlanningError::DependencyCycle {
            operations: stuck,
            suggestion: CYCLE_SUGGESTION.to_string(),
        });
    }

    debug!(operations = n, "operations ordered");
    let mut slots: Vec<Option<SchemaOperation>> = operations.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

/// Whether `first` has to run before `second`.
fn must_precede(first: &SchemaOperation, second: &SchemaOperation) -> bool {
    use SchemaOperation::*;

    let first_key = first.table_key();
    let second_key = second.table_key();

    match first {
        CreateTable { table } => {
            if second.touched_tables().contains(&table.key()) {
                return true;
            }
        }
        RenameTable { to, .. } => {
            let to_key = normalize_ident(to);
            if !frees_name(second, &to_key) && second.touched_tables().contains(&to_key) {
                return true;
            }
        }
        _ => {}
    }

    // The new name has to be free before a rename takes it.
    if let RenameTable { to, .. } = second {
        if frees_name(first, &normalize_ident(to)) {
            return true;
        }
    }

    match (first, second) {
        // Dependents go before what they depend on.
        (
            DropConstraint { .. } | DropIndex { .. },
            DropColumn { .. } | DropTable { .. } | AlterColumnType { .. } | AddConstraint { .. }
            | CreateIndex { .. },
        ) if first_key == second_key => true,

        (DropConstraint { constraint, .. }, DropTable { .. } | DropColumn { .. } | DropIndex { .. })
            if references(constraint, &first_key, &second_key) =>
        {
            true
        }
        (DropConstraint { constraint, .. }, DropConstraint { constraint: other, .. })
            if references(constraint, &first_key, &second_key)
                && !matches!(other, ConstraintDef::ForeignKey(_)) =>
        {
            true
        }

        (DropTable { table }, DropTable { .. }) => {
            second_key != first_key && table.referenced_tables().contains(&second_key)
        }

        // Columns exist before anything indexes or references them.
        (
            AddColumn { .. } | AlterColumnType { .. },
            AddConstraint { .. } | CreateIndex { .. },
        ) if first_key == second_key => true,
        (AddColumn { .. } | AlterColumnType { .. }, AddConstraint { constraint, .. }) => {
            references(constraint, &second_key, &first_key)
        }

        // Referenced keys exist before the foreign keys that use them.
        (AddConstraint { constraint: key, .. }, AddConstraint { constraint, .. })
            if matches!(key, ConstraintDef::PrimaryKey { .. } | ConstraintDef::Unique { .. }) =>
        {
            references(constraint, &second_key, &first_key)
                || (first_key == second_key
                    && constraint
                        .referenced_table()
                        .is_some_and(|r| normalize_ident(r) == first_key))
        }

        _ => false,
    }
}

/// Whether `op` releases the table name `key`.
fn frees_name(op: &SchemaOperation, key: &str) -> bool {
    match op {
        SchemaOperation::DropTable { table } => table.key() == key,
        SchemaOperation::RenameTable { from, .. } => normalize_ident(from) == key,
        _ => false,
    }
}

/// Whether `constraint`, declared on `owner`, is a foreign key into
/// another table `target`.
fn references(constraint: &ConstraintDef, owner: &str, target: &str) -> bool {
    owner != target
        && constraint
            .referenced_table()
            .is_some_and(|r| normalize_ident(r) == target)
}

struct Simulation {
    forward: Vec<SchemaOperation>,
    inverse: Vec<SchemaOperation>,
    expected: SchemaSnapshot,
}

/// Apply `ordered` to a copy of `current`, refreshing drops with what they
/// remove and collecting inverses.
fn simulate(ordered: Vec<SchemaOperation>, current: &SchemaSnapshot) -> Result<Simulation, PlanningError> {
    let mut state = current.clone();
    let mut forward = Vec::with_capacity(ordered.len());
    let mut inverse = Vec::with_capacity(ordered.len());

    for op in ordered {
        let op = refresh(op, &state);
        let undo = op.inverse();
        state.apply(&op).map_err(|source| PlanningError::Inapplicable {
            operation: op.describe(),
            source,
        })?;
        forward.push(op);
        inverse.push(undo);
    }
    inverse.reverse();

    Ok(Simulation {
        forward,
        inverse,
        expected: state,
    })
}

/// Replace the definition carried by a removing operation with the one the
/// schema holds at that point.
fn refresh(op: SchemaOperation, state: &SchemaSnapshot) -> SchemaOperation {
    match op {
        SchemaOperation::DropTable { table } => SchemaOperation::DropTable {
            table: state.table(&table.name).cloned().unwrap_or(table),
        },
        SchemaOperation::DropColumn { table, column } => {
            let column = state
                .table(&table)
                .and_then(|t| t.column(&column.name))
                .cloned()
                .unwrap_or(column);
            SchemaOperation::DropColumn { table, column }
        }
        SchemaOperation::AlterColumnType { table, from, to } => {
            let from = state
                .table(&table)
                .and_then(|t| t.column(&from.name))
                .cloned()
                .unwrap_or(from);
            SchemaOperation::AlterColumnType { table, from, to }
        }
        SchemaOperation::DropConstraint { table, constraint } => {
            let constraint = state
                .table(&table)
                .and_then(|t| t.constraint_by_signature(&constraint.signature()))
                .cloned()
                .unwrap_or(constraint);
            SchemaOperation::DropConstraint { table, constraint }
        }
        SchemaOperation::DropIndex { table, index } => {
            let index = state
                .table(&table)
                .and_then(|t| t.index(&index.name))
                .cloned()
                .unwrap_or(index);
            SchemaOperation::DropIndex { table, index }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, IndexDef, TableDefinition};

    fn customers() -> TableDefinition {
        TableDefinition::new("customers")
            .with_column(ColumnDef::new("id", ColumnType::Integer))
            .with_constraint(ConstraintDef::primary_key(["id"]))
    }

    fn orders() -> TableDefinition {
        TableDefinition::new("orders")
            .with_column(ColumnDef::new("id", ColumnType::Integer))
            .with_column(ColumnDef::new("customer_id", ColumnType::Integer))
            .with_constraint(ConstraintDef::primary_key(["id"]))
            .with_constraint(ConstraintDef::foreign_key(
                "fk_customer",
                "customer_id",
                "customers",
                "id",
            ))
            .with_index(IndexDef::new("idx_orders_customer", ["customer_id"]))
    }

    fn descriptions(ops: &[SchemaOperation]) -> Vec<String> {
        ops.iter().map(|op| op.describe()).collect()
    }

    #[test]
    fn test_related_tables_created_before_foreign_key() {
        let target = SchemaSnapshot::new().with_table(orders()).with_table(customers());
        let plan = plan_migration(&SchemaSnapshot::new(), &target, PlanOptions::default()).unwrap();

        assert_eq!(
            descriptions(&plan.operations),
            vec![
                "CreateTable(customers)",
                "CreateTable(orders)",
                "AddConstraint(orders.fk_customer)",
            ]
        );
        assert_eq!(
            descriptions(&plan.rollback.operations),
            vec![
                "DropConstraint(orders.fk_customer)",
                "DropTable(orders)",
                "DropTable(customers)",
            ]
        );
        assert_eq!(plan.metadata.tier, CompatibilityTier::Safe);
        assert_eq!(plan.version.len(), 16);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let target = SchemaSnapshot::new().with_table(orders()).with_table(customers());
        let first = plan_migration(&SchemaSnapshot::new(), &target, PlanOptions::default()).unwrap();
        let second = plan_migration(&SchemaSnapshot::new(), &target, PlanOptions::default()).unwrap();
        assert_eq!(first.operations, second.operations);
        assert_eq!(first.version, second.version);
    }

    #[test]
    fn test_rollback_restores_current() {
        let current = SchemaSnapshot::new().with_table(customers()).with_table(orders());
        let target = SchemaSnapshot::new().with_table(customers());
        let plan = plan_migration(&current, &target, PlanOptions::default().allow_destructive())
            .unwrap();

        let mut state = plan.expected_snapshot(&current).unwrap();
        state.apply_all(&plan.rollback.operations).unwrap();
        assert_eq!(state.checksum(), current.checksum());
    }

    #[test]
    fn test_destructive_requires_flag() {
        let current = SchemaSnapshot::new().with_table(customers()).with_table(orders());
        let target = SchemaSnapshot::new().with_table(customers());
        let err = plan_migration(&current, &target, PlanOptions::default()).unwrap_err();
        match err {
            PlanningError::ConfirmationRequired { tier, operations, .. } => {
                assert_eq!(tier, CompatibilityTier::Destructive);
                assert_eq!(operations, vec!["DropTable(orders)"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_not_null_requires_confirmation() {
        let current = SchemaSnapshot::new().with_table(
            customers().with_column(ColumnDef::nullable("email", ColumnType::Text)),
        );
        let target = SchemaSnapshot::new()
            .with_table(customers().with_column(ColumnDef::new("email", ColumnType::Text)));
        let err = plan_migration(&current, &target, PlanOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            PlanningError::ConfirmationRequired {
                tier: CompatibilityTier::RequiresConfirmation,
                ..
            }
        ));
        assert!(plan_migration(&current, &target, PlanOptions::default().confirm_risky()).is_ok());
    }

    #[test]
    fn test_drop_constraint_before_dropping_referenced_table() {
        let current = SchemaSnapshot::new().with_table(customers()).with_table(orders());
        let mut unlinked = orders();
        unlinked.constraints.retain(|c| c.referenced_table().is_none());
        let target = SchemaSnapshot::new().with_table(unlinked);
        let plan = plan_migration(&current, &target, PlanOptions::default().allow_destructive().confirm_risky())
            .unwrap();
        assert_eq!(
            descriptions(&plan.operations),
            vec!["DropConstraint(orders.fk_customer)", "DropTable(customers)"]
        );
    }

    #[test]
    fn test_mutual_drops_split() {
        let a = TableDefinition::new("a")
            .with_column(ColumnDef::new("id", ColumnType::Integer))
            .with_column(ColumnDef::nullable("b_id", ColumnType::Integer))
            .with_constraint(ConstraintDef::primary_key(["id"]))
            .with_constraint(ConstraintDef::foreign_key("fk_a_b", "b_id", "b", "id"));
        let b = TableDefinition::new("b")
            .with_column(ColumnDef::new("id", ColumnType::Integer))
            .with_column(ColumnDef::nullable("a_id", ColumnType::Integer))
            .with_constraint(ConstraintDef::primary_key(["id"]))
            .with_constraint(ConstraintDef::foreign_key("fk_b_a", "a_id", "a", "id"));
        let current = SchemaSnapshot::new().with_table(a).with_table(b);
        let plan = plan_migration(&current, &SchemaSnapshot::new(), PlanOptions::default().allow_destructive())
            .unwrap();

        assert_eq!(
            descriptions(&plan.operations),
            vec![
                "DropConstraint(a.fk_a_b)",
                "DropConstraint(b.fk_b_a)",
                "DropTable(a)",
                "DropTable(b)",
            ]
        );
        let mut state = plan.expected_snapshot(&current).unwrap();
        state.apply_all(&plan.rollback.operations).unwrap();
        assert_eq!(state.checksum(), current.checksum());
    }

    #[test]
    fn test_rename_swap_is_a_cycle() {
        let current = SchemaSnapshot::new()
            .with_table(TableDefinition::new("a"))
            .with_table(TableDefinition::new("b"));
        let ops = vec![
            SchemaOperation::RenameTable {
                from: "a".into(),
                to: "b".into(),
            },
            SchemaOperation::RenameTable {
                from: "b".into(),
                to: "a".into(),
            },
        ];
        let err = MigrationPlanner::new(PlanOptions::default().allow_destructive())
            .plan(ops, &current)
            .unwrap_err();
        match err {
            PlanningError::DependencyCycle { operations, suggestion } => {
                assert_eq!(operations.len(), 2);
                assert!(suggestion.contains("intermediate"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let target = SchemaSnapshot::new().with_table(orders());
        let err = plan_migration(&SchemaSnapshot::new(), &target, PlanOptions::default()).unwrap_err();
        match err {
            PlanningError::DanglingReferences { references } => {
                assert_eq!(references[0].references, "customers");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_inapplicable_operation() {
        let ops = vec![SchemaOperation::AddColumn {
            table: "missing".into(),
            column: ColumnDef::nullable("x", ColumnType::Integer),
        }];
        let err = MigrationPlanner::default().plan(ops, &SchemaSnapshot::new()).unwrap_err();
        assert!(matches!(err, PlanningError::Inapplicable { .. }));
    }

    #[test]
    fn test_drop_refreshed_from_current() {
        let current = SchemaSnapshot::new().with_table(customers()).with_table(orders());
        let ops = vec![SchemaOperation::DropIndex {
            table: "orders".into(),
            index: IndexDef::new("idx_orders_customer", ["ignored"]),
        }];
        let plan = MigrationPlanner::default().plan(ops, &current).unwrap();
        match &plan.rollback.operations[0] {
            SchemaOperation::CreateIndex { index, .. } => {
                assert_eq!(index.columns, vec!["customer_id".to_string()]);
            }
            other => panic!("unexpected inverse: {other}"),
        }
    }

    #[test]
    fn test_undo_first_takes_suffix() {
        let rollback = RollbackPlan {
            operations: vec![
                SchemaOperation::RenameTable {
                    from: "c".into(),
                    to: "d".into(),
                },
                SchemaOperation::RenameTable {
                    from: "a".into(),
                    to: "b".into(),
                },
            ],
        };
        assert_eq!(rollback.undo_first(1).len(), 1);
        assert_eq!(rollback.undo_first(1)[0].describe(), "RenameTable(a -> b)");
        assert_eq!(rollback.undo_first(5).len(), 2);
    }
}

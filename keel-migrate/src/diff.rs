//! Model diffing.
//!
//! [`diff`] compares two models and produces an ordered step list. Steps are
//! ordered by [`StepPhase`] so that dependent objects are dropped before what
//! they depend on and created after it. Within the table phases, tables are
//! ordered topologically over their foreign keys.
//!
//! Renames are not detected: a renamed column or index surfaces as a drop
//! and an add.

use std::collections::{BTreeMap, BTreeSet};

use keel_schema::{Index, Model, Table, Tables};
use tracing::debug;

use crate::step::{MigrationStep, PrimaryKeyChange, StepPhase};

/// Difference between two models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDiff {
    /// Hash of the starting model.
    pub from_hash: String,
    /// Hash of the target model.
    pub to_hash: String,
    /// Ordered steps.
    pub steps: Vec<MigrationStep>,
}

impl MigrationDiff {
    /// A diff between a model and itself.
    pub fn empty(hash: impl Into<String>) -> Self {
        let hash = hash.into();
        Self {
            from_hash: hash.clone(),
            to_hash: hash,
            steps: Vec::new(),
        }
    }

    /// Whether the models differ. A change that leaves the tables untouched
    /// still counts, because the model hash moves.
    pub fn has_changes(&self) -> bool {
        self.from_hash != self.to_hash
    }

    /// Whether there are no structural steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps that can lose data.
    pub fn destructive_steps(&self) -> Vec<&MigrationStep> {
        self.steps.iter().filter(|s| s.is_destructive()).collect()
    }

    /// Get a summary of the diff.
    pub fn summary(&self) -> String {
        if !self.has_changes() {
            return "No changes".to_string();
        }
        if self.steps.is_empty() {
            return "No structural changes".to_string();
        }

        let mut counts: BTreeMap<StepPhase, usize> = BTreeMap::new();
        for step in &self.steps {
            *counts.entry(step.phase()).or_default() += 1;
        }

        let parts: Vec<String> = counts
            .into_iter()
            .map(|(phase, count)| {
                let (verb, noun) = match phase {
                    StepPhase::DropForeignKey => ("Drop", "foreign keys"),
                    StepPhase::DropIndex => ("Drop", "indexes"),
                    StepPhase::DropColumn => ("Drop", "columns"),
                    StepPhase::DropTable => ("Drop", "tables"),
                    StepPhase::CreateTable => ("Create", "tables"),
                    StepPhase::AddColumn => ("Add", "columns"),
                    StepPhase::AlterColumn => ("Alter", "columns"),
                    StepPhase::AddIndex => ("Create", "indexes"),
                    StepPhase::AddForeignKey => ("Add", "foreign keys"),
                };
                format!("{} {} {}", verb, count, noun)
            })
            .collect();
        parts.join(", ")
    }
}

/// Diff two models.
pub fn diff(from: &Model, to: &Model) -> MigrationDiff {
    if from.hash == to.hash {
        return MigrationDiff::empty(&from.hash);
    }

    let steps = diff_tables(&from.tables, &to.tables);
    debug!(from = %from.hash, to = %to.hash, steps = steps.len(), "diffed models");

    MigrationDiff {
        from_hash: from.hash.clone(),
        to_hash: to.hash.clone(),
        steps,
    }
}

/// Diff two table sets into ordered steps.
pub fn diff_tables(from: &Tables, to: &Tables) -> Vec<MigrationStep> {
    let mut steps = Vec::new();

    for (name, table) in to {
        match from.get(name) {
            None => create_table_steps(table, &mut steps),
            Some(previous) => alter_table_steps(previous, table, &mut steps),
        }
    }
    for (name, table) in from {
        if !to.contains_key(name) {
            drop_table_steps(table, &mut steps);
        }
    }

    annotate_primary_keys(order_steps(steps, from, to), from)
}

/// Record the table's whole primary key on every alter that toggles a
/// column's `primary` flag, as the key stands at that point of the sequence.
fn annotate_primary_keys(mut steps: Vec<MigrationStep>, from: &Tables) -> Vec<MigrationStep> {
    let mut tables = from.clone();
    for step in &mut steps {
        if let MigrationStep::AlterColumn {
            table,
            from: previous,
            to,
            primary_key,
        } = step
        {
            if previous.primary != to.primary {
                *primary_key = tables.get(table.as_str()).map(|current| PrimaryKeyChange::of(current, to));
            }
        }
        if step.apply_to(&mut tables).is_err() {
            break;
        }
    }
    steps
}

/// Order steps by phase, then by foreign-key dependency for table creation and
/// removal, then by table and object name.
///
/// `from` and `to` supply the foreign-key graphs for drops and creates.
pub fn order_steps(steps: Vec<MigrationStep>, from: &Tables, to: &Tables) -> Vec<MigrationStep> {
    let created: BTreeSet<&str> = steps
        .iter()
        .filter_map(|s| match s {
            MigrationStep::CreateTable { table } => Some(table.name.as_str()),
            _ => None,
        })
        .collect();
    let dropped: BTreeSet<&str> = steps
        .iter()
        .filter_map(|s| match s {
            MigrationStep::DropTable { table } => Some(table.name.as_str()),
            _ => None,
        })
        .collect();

    let create_rank = rank(&topological_order(to, &created));
    let mut drop_order = topological_order(from, &dropped);
    drop_order.reverse();
    let drop_rank = rank(&drop_order);

    let mut keyed: Vec<_> = steps
        .into_iter()
        .map(|step| {
            let position = match &step {
                MigrationStep::CreateTable { table } => create_rank.get(&table.name).copied(),
                MigrationStep::DropTable { table } => drop_rank.get(&table.name).copied(),
                _ => None,
            }
            .unwrap_or(0);
            let target = step.target();
            let key = (
                step.phase(),
                position,
                target.table().to_string(),
                target.object().map(str::to_string),
            );
            (key, step)
        })
        .collect();

    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, step)| step).collect()
}

fn rank(order: &[String]) -> BTreeMap<String, usize> {
    order
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), i))
        .collect()
}

/// Kahn's algorithm over the foreign keys among `subset`, referenced tables
/// first, alphabetical among ready tables. Tables in a cycle are appended in
/// alphabetical order.
fn topological_order(tables: &Tables, subset: &BTreeSet<&str>) -> Vec<String> {
    let mut dependencies: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for name in subset {
        let deps = tables
            .get(*name)
            .map(|table| {
                table
                    .foreign_keys
                    .iter()
                    .map(|fk| fk.referenced_table.as_str())
                    .filter(|target| target != name && subset.contains(target))
                    .collect()
            })
            .unwrap_or_default();
        dependencies.insert(*name, deps);
    }

    let mut order = Vec::with_capacity(subset.len());
    let mut placed: BTreeSet<&str> = BTreeSet::new();

    loop {
        let ready: Vec<&str> = dependencies
            .iter()
            .filter(|(name, deps)| !placed.contains(*name) && deps.iter().all(|d| placed.contains(d)))
            .map(|(name, _)| *name)
            .collect();
        let Some(&next) = ready.first() else {
            break;
        };
        placed.insert(next);
        order.push(next.to_string());
    }

    for name in subset {
        if !placed.contains(name) {
            order.push(name.to_string());
        }
    }
    order
}

fn create_table_steps(table: &Table, steps: &mut Vec<MigrationStep>) {
    steps.push(MigrationStep::CreateTable {
        table: table.without_constraints(),
    });
    for index in &table.indexes {
        steps.push(MigrationStep::AddIndex {
            table: table.name.clone(),
            index: index.clone(),
        });
    }
    for foreign_key in &table.foreign_keys {
        steps.push(MigrationStep::AddForeignKey {
            table: table.name.clone(),
            foreign_key: foreign_key.clone(),
        });
    }
}

fn drop_table_steps(table: &Table, steps: &mut Vec<MigrationStep>) {
    for foreign_key in &table.foreign_keys {
        steps.push(MigrationStep::DropForeignKey {
            table: table.name.clone(),
            foreign_key: foreign_key.clone(),
        });
    }
    for index in &table.indexes {
        steps.push(MigrationStep::DropIndex {
            table: table.name.clone(),
            index: index.clone(),
        });
    }
    steps.push(MigrationStep::DropTable {
        table: table.without_constraints(),
    });
}

fn alter_table_steps(from: &Table, to: &Table, steps: &mut Vec<MigrationStep>) {
    let name = &to.name;

    for (column_name, column) in &to.columns {
        match from.columns.get(column_name) {
            None => steps.push(MigrationStep::AddColumn {
                table: name.clone(),
                column: column.clone(),
            }),
            Some(previous) if previous != column => steps.push(MigrationStep::AlterColumn {
                table: name.clone(),
                from: previous.clone(),
                to: column.clone(),
                primary_key: None,
            }),
            Some(_) => {}
        }
    }
    for (column_name, column) in &from.columns {
        if !to.columns.contains_key(column_name) {
            steps.push(MigrationStep::DropColumn {
                table: name.clone(),
                column: column.clone(),
            });
        }
    }

    // Indexes match on (sorted columns, unique); a changed name is a new index.
    let same_index = |a: &Index, b: &Index| a.key() == b.key() && a.name == b.name;
    for index in &from.indexes {
        if !to.indexes.iter().any(|other| same_index(index, other)) {
            steps.push(MigrationStep::DropIndex {
                table: name.clone(),
                index: index.clone(),
            });
        }
    }
    for index in &to.indexes {
        if !from.indexes.iter().any(|other| same_index(index, other)) {
            steps.push(MigrationStep::AddIndex {
                table: name.clone(),
                index: index.clone(),
            });
        }
    }

    for foreign_key in &from.foreign_keys {
        if to.foreign_key(&foreign_key.name) != Some(foreign_key) {
            steps.push(MigrationStep::DropForeignKey {
                table: name.clone(),
                foreign_key: foreign_key.clone(),
            });
        }
    }
    for foreign_key in &to.foreign_keys {
        if from.foreign_key(&foreign_key.name) != Some(foreign_key) {
            steps.push(MigrationStep::AddForeignKey {
                table: name.clone(),
                foreign_key: foreign_key.clone(),
            });
        }
    }
}

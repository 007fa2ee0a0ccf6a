//! Three-way merge of divergent branches.
//!
//! Both branches are diffed against their common base. Steps touching
//! different objects are concatenated, local first, then stably re-ordered by
//! phase. Steps that touch the same object must be identical on both sides;
//! anything else is a [`ConflictError`] and is never resolved automatically.
//! The merged entity set is merged the same way (entity, then field), so
//! disagreements that produce no steps, like validation bounds, still
//! conflict.

use std::collections::{BTreeMap, BTreeSet};

use keel_schema::{EntityDefinition, EntitySet, Model, ModelBuilder, structure_hash};
use tracing::info;

use crate::diff::diff_tables;
use crate::error::{ConflictError, MigrateResult};
use crate::record::MigrationRecord;
use crate::step::{MigrationStep, StepTarget};

/// Result of merging two branches.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedMigration {
    /// Migration from the base to the merged model.
    pub record: MigrationRecord,
    /// The merged model.
    pub model: Model,
    /// Local branch hash.
    pub local_hash: String,
    /// Remote branch hash.
    pub remote_hash: String,
}

/// Merge `local` and `remote`, which both descend from `base`.
pub fn resolve(base: &Model, local: &Model, remote: &Model) -> MigrateResult<MergedMigration> {
    resolve_with(&ModelBuilder::new(), base, local, remote)
}

/// [`resolve`] with a specific model builder for the merged model.
pub fn resolve_with(
    builder: &ModelBuilder,
    base: &Model,
    local: &Model,
    remote: &Model,
) -> MigrateResult<MergedMigration> {
    let hashes = Hashes {
        base: &base.hash,
        local: &local.hash,
        remote: &remote.hash,
    };

    let local_steps = diff_tables(&base.tables, &local.tables);
    let remote_steps = diff_tables(&base.tables, &remote.tables);
    check_step_conflicts(&hashes, &local_steps, &remote_steps)?;

    let entities = merge_entities(&hashes, &base.entities, &local.entities, &remote.entities)?;
    let sides = [&base.entities, &local.entities, &remote.entities];
    check_relation_targets(&hashes, &entities, sides)?;
    let model = builder.build(&entities)?;

    let mut steps = local_steps;
    for step in remote_steps {
        if !steps.contains(&step) {
            steps.push(step);
        }
    }
    steps.sort_by_key(MigrationStep::phase);

    let mut tables = base.tables.clone();
    for step in &steps {
        step.apply_to(&mut tables).map_err(|reason| {
            let target = step.target();
            let mut conflict = ConflictError::new(
                hashes.base,
                hashes.local,
                hashes.remote,
                target.table(),
                format!("merged step `{}` cannot apply: {}", step, reason),
            );
            if let Some(object) = target.object() {
                conflict = conflict.column(object);
            }
            conflict
        })?;
    }
    if structure_hash(&tables)? != model.structure_hash()? {
        return Err(ConflictError::new(
            hashes.base,
            hashes.local,
            hashes.remote,
            "*",
            "merged steps do not reproduce the merged model",
        )
        .into());
    }

    let record = MigrationRecord::new(&base.hash, &model.hash, steps)?
        .with_description(format!("Merge of {} and {}", local.hash, remote.hash));

    info!(
        base = %base.hash,
        local = %local.hash,
        remote = %remote.hash,
        merged = %model.hash,
        steps = record.steps.len(),
        "merged branches"
    );

    Ok(MergedMigration {
        record,
        model,
        local_hash: local.hash.clone(),
        remote_hash: remote.hash.clone(),
    })
}

struct Hashes<'a> {
    base: &'a str,
    local: &'a str,
    remote: &'a str,
}

impl Hashes<'_> {
    fn conflict(&self, table: &str, detail: impl Into<String>) -> ConflictError {
        ConflictError::new(self.base, self.local, self.remote, table, detail)
    }
}

fn group(steps: &[MigrationStep]) -> BTreeMap<StepTarget, Vec<&MigrationStep>> {
    let mut groups: BTreeMap<StepTarget, Vec<&MigrationStep>> = BTreeMap::new();
    for step in steps {
        groups.entry(step.target()).or_default().push(step);
    }
    groups
}

fn check_step_conflicts(
    hashes: &Hashes<'_>,
    local: &[MigrationStep],
    remote: &[MigrationStep],
) -> Result<(), ConflictError> {
    let local_groups = group(local);
    let remote_groups = group(remote);

    for (target, local_steps) in &local_groups {
        if let Some(remote_steps) = remote_groups.get(target) {
            if local_steps != remote_steps {
                return Err(step_conflict(
                    hashes,
                    target,
                    "both branches change this differently",
                    local_steps[0],
                    remote_steps[0],
                ));
            }
        }
    }

    // A table created or dropped on one side owns every step on that table.
    for (ours, theirs, ours_is_local) in [
        (&local_groups, &remote_groups, true),
        (&remote_groups, &local_groups, false),
    ] {
        for (target, our_steps) in ours {
            let StepTarget::Table(table) = target else {
                continue;
            };
            for (other, their_steps) in theirs {
                if other.table() != table || ours.get(other) == Some(their_steps) {
                    continue;
                }
                let (local_step, remote_step) = if ours_is_local {
                    (our_steps[0], their_steps[0])
                } else {
                    (their_steps[0], our_steps[0])
                };
                return Err(step_conflict(
                    hashes,
                    other,
                    format!("table `{}` is created or dropped on one branch and changed on the other", table),
                    local_step,
                    remote_step,
                ));
            }
        }
    }
    Ok(())
}

fn step_conflict(
    hashes: &Hashes<'_>,
    target: &StepTarget,
    detail: impl Into<String>,
    local: &MigrationStep,
    remote: &MigrationStep,
) -> ConflictError {
    let mut conflict = hashes.conflict(target.table(), detail).steps(local.clone(), remote.clone());
    if let Some(object) = target.object() {
        conflict = conflict.column(object);
    }
    conflict
}

enum Pick<T> {
    Take(Option<T>),
    Conflict,
}

/// Three-way pick: a side that left the base value unchanged yields to the other.
fn pick<T: PartialEq + Clone>(base: Option<&T>, local: Option<&T>, remote: Option<&T>) -> Pick<T> {
    if local == remote {
        Pick::Take(local.cloned())
    } else if local == base {
        Pick::Take(remote.cloned())
    } else if remote == base {
        Pick::Take(local.cloned())
    } else {
        Pick::Conflict
    }
}

fn merge_entities(
    hashes: &Hashes<'_>,
    base: &BTreeMap<String, EntityDefinition>,
    local: &BTreeMap<String, EntityDefinition>,
    remote: &BTreeMap<String, EntityDefinition>,
) -> Result<EntitySet, ConflictError> {
    let names: BTreeSet<&String> = base.keys().chain(local.keys()).chain(remote.keys()).collect();
    let mut merged = EntitySet::new();

    for name in names {
        let (b, l, r) = (base.get(name), local.get(name), remote.get(name));
        match pick(b, l, r) {
            Pick::Take(Some(entity)) => {
                merged.insert(name.clone(), entity);
            }
            Pick::Take(None) => {}
            Pick::Conflict => match (b, l, r) {
                (Some(b), Some(l), Some(r)) => {
                    merged.insert(name.clone(), merge_entity(hashes, b, l, r)?);
                }
                _ => {
                    let table = l.or(r).map(|e| e.table.as_str()).unwrap_or(name.as_str());
                    return Err(hashes.conflict(
                        table,
                        format!(
                            "entity `{}` is added or removed on one branch and defined differently on the other",
                            name
                        ),
                    ));
                }
            },
        }
    }
    Ok(merged)
}

fn merge_entity(
    hashes: &Hashes<'_>,
    base: &EntityDefinition,
    local: &EntityDefinition,
    remote: &EntityDefinition,
) -> Result<EntityDefinition, ConflictError> {
    let table = match pick(Some(&base.table), Some(&local.table), Some(&remote.table)) {
        Pick::Take(Some(table)) => table,
        _ => {
            return Err(hashes.conflict(
                &local.table,
                format!("table renamed to `{}` and `{}`", local.table, remote.table),
            ));
        }
    };

    let mut merged = EntityDefinition::new(table.clone());

    let field_names = ordered_union(base.fields.keys(), local.fields.keys(), remote.fields.keys());
    for name in field_names {
        let (b, l, r) = (base.fields.get(name), local.fields.get(name), remote.fields.get(name));
        match pick(b, l, r) {
            Pick::Take(Some(field)) => {
                merged.fields.insert(name.clone(), field);
            }
            Pick::Take(None) => {}
            Pick::Conflict => {
                let column = l.or(r).map(|f| f.column_name(name)).unwrap_or(name.as_str());
                return Err(hashes
                    .conflict(&table, format!("field `{}` changed differently on both branches", name))
                    .column(column));
            }
        }
    }

    match pick(Some(&base.indexes), Some(&local.indexes), Some(&remote.indexes)) {
        Pick::Take(indexes) => merged.indexes = indexes.unwrap_or_default(),
        Pick::Conflict => {
            return Err(hashes.conflict(&table, "indexes changed differently on both branches"));
        }
    }

    let relation_names = ordered_union(
        base.relations.keys(),
        local.relations.keys(),
        remote.relations.keys(),
    );
    for name in relation_names {
        let (b, l, r) = (
            base.relations.get(name),
            local.relations.get(name),
            remote.relations.get(name),
        );
        match pick(b, l, r) {
            Pick::Take(Some(relation)) => {
                merged.relations.insert(name.clone(), relation);
            }
            Pick::Take(None) => {}
            Pick::Conflict => {
                return Err(hashes
                    .conflict(&table, format!("relation `{}` changed differently on both branches", name))
                    .column(name));
            }
        }
    }

    Ok(merged)
}

/// Every relation in the merged set must still have its target entity.
fn check_relation_targets(
    hashes: &Hashes<'_>,
    merged: &EntitySet,
    sides: [&BTreeMap<String, EntityDefinition>; 3],
) -> Result<(), ConflictError> {
    for entity in merged.values() {
        for (name, relation) in &entity.relations {
            if merged.contains_key(&relation.target) {
                continue;
            }
            let target_table = sides
                .iter()
                .find_map(|side| side.get(&relation.target))
                .map(|target| target.table.as_str())
                .unwrap_or(relation.target.as_str());
            return Err(hashes
                .conflict(
                    &entity.table,
                    format!(
                        "relation `{}` on `{}` references `{}` (table `{}`), which the other branch removed",
                        name, entity.table, relation.target, target_table
                    ),
                )
                .column(name));
        }
    }
    Ok(())
}

/// Local names in order, then remote additions, then names only the base had.
fn ordered_union<'a>(
    base: impl Iterator<Item = &'a String>,
    local: impl Iterator<Item = &'a String>,
    remote: impl Iterator<Item = &'a String>,
) -> Vec<&'a String> {
    let mut seen = BTreeSet::new();
    local
        .chain(remote)
        .chain(base)
        .filter(|name| seen.insert(*name))
        .collect()
}

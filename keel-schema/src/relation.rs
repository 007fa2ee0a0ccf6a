//! Relation resolution.
//!
//! Relations are turned into plain foreign-key fields before anything is
//! hashed or built:
//!
//! - `belongsTo` generates `<relation>Id` (or `foreignKey`) on the owner,
//!   typed like the target's primary key. An explicit field of that name wins.
//! - `hasMany` / `hasOne` must find their foreign key on the target.
//! - `manyToMany` synthesizes a join entity with two key columns.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::entity::{
    EntityDefinition, EntityField, EntitySet, ReferentialAction, RelationDefinition,
    RelationKind, lower_camel,
};
use crate::error::{SchemaError, SchemaResult};

/// A foreign-key constraint derived from a relation, in field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeySpec {
    /// Entity holding the foreign-key fields.
    pub entity: String,
    /// Relation that produced the constraint (`Entity.relation`).
    pub relation: String,
    /// Foreign-key fields on `entity`.
    pub fields: Vec<String>,
    /// Referenced entity.
    pub target: String,
    /// Referenced fields on `target`.
    pub target_fields: Vec<String>,
    /// Action on delete.
    pub on_delete: Option<ReferentialAction>,
}

/// Entities after relation resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSchema {
    /// Entities by name, including synthesized join entities.
    pub entities: BTreeMap<String, EntityDefinition>,
    /// Foreign keys sorted by entity then fields.
    pub foreign_keys: Vec<ForeignKeySpec>,
}

/// Resolve all relations of an entity set.
pub fn resolve_relations(entities: &EntitySet) -> SchemaResult<ResolvedSchema> {
    let mut resolved: BTreeMap<String, EntityDefinition> = entities
        .iter()
        .map(|(name, entity)| (name.clone(), entity.clone()))
        .collect();

    for (name, entity) in &resolved {
        for (relation_name, relation) in &entity.relations {
            if !resolved.contains_key(&relation.target) {
                return Err(SchemaError::UnknownEntity {
                    entity: name.clone(),
                    relation: relation_name.clone(),
                    target: relation.target.clone(),
                });
            }
        }
    }

    synthesize_join_entities(&mut resolved)?;

    let mut foreign_keys = resolve_belongs_to(&mut resolved)?;
    resolve_inverse_relations(&resolved, &mut foreign_keys)?;

    foreign_keys.sort_by(|a, b| (&a.entity, &a.fields).cmp(&(&b.entity, &b.fields)));

    Ok(ResolvedSchema {
        entities: resolved,
        foreign_keys,
    })
}

fn sorted_relations(
    entity: &EntityDefinition,
    kinds: &[RelationKind],
) -> Vec<(String, RelationDefinition)> {
    let mut relations: Vec<_> = entity
        .relations
        .iter()
        .filter(|(_, r)| kinds.contains(&r.kind))
        .map(|(name, r)| (name.clone(), r.clone()))
        .collect();
    relations.sort_by(|a, b| a.0.cmp(&b.0));
    relations
}

/// Default join table name: both table names sorted and joined by `_`.
pub fn join_table_name(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}_{}", a, b)
    } else {
        format!("{}_{}", b, a)
    }
}

fn single_primary(
    entities: &BTreeMap<String, EntityDefinition>,
    target: &str,
    entity: &str,
    relation: &str,
) -> SchemaResult<(String, EntityField)> {
    let Some(definition) = entities.get(target) else {
        return Err(SchemaError::UnknownEntity {
            entity: entity.to_string(),
            relation: relation.to_string(),
            target: target.to_string(),
        });
    };

    let mut primaries = definition.primary_fields();
    match (primaries.next(), primaries.next()) {
        (Some((name, field)), None) => Ok((name.clone(), field.clone())),
        _ => Err(SchemaError::invalid_relation(
            entity,
            relation,
            format!("target `{}` must have exactly one primary key field", target),
        )),
    }
}

fn key_like(key: &EntityField) -> EntityField {
    EntityField {
        field_type: key.field_type,
        db_type: key.db_type.clone(),
        max: key.max,
        ..Default::default()
    }
}

fn is_compatible_key(field: &EntityField, key: &EntityField) -> bool {
    field.field_type == key.field_type && field.db_type == key.db_type
}

fn synthesize_join_entities(resolved: &mut BTreeMap<String, EntityDefinition>) -> SchemaResult<()> {
    let owners: Vec<String> = resolved.keys().cloned().collect();

    for owner in owners {
        let Some(owner_def) = resolved.get(&owner) else {
            continue;
        };
        let owner_table = owner_def.table.clone();

        for (relation_name, relation) in sorted_relations(owner_def, &[RelationKind::ManyToMany]) {
            let target_table = resolved
                .get(&relation.target)
                .map(|t| t.table.clone())
                .unwrap_or_default();
            let through = relation
                .through
                .clone()
                .unwrap_or_else(|| join_table_name(&owner_table, &target_table));

            // An explicit join entity, or one generated from the other side.
            if resolved.values().any(|e| e.table == through) {
                continue;
            }

            let owner_key_name = format!("{}Id", lower_camel(&owner));
            let target_key_name = format!("{}Id", lower_camel(&relation.target));
            if owner_key_name == target_key_name {
                return Err(SchemaError::foreign_key_collision(
                    through,
                    owner_key_name,
                    relation_name,
                    "both sides of the join generate the same column; declare the join entity explicitly",
                ));
            }

            let (_, owner_key) = single_primary(resolved, &owner, &owner, &relation_name)?;
            let (_, target_key) =
                single_primary(resolved, &relation.target, &owner, &relation_name)?;

            if resolved.contains_key(&through) {
                return Err(SchemaError::duplicate("entity", through));
            }

            let join = EntityDefinition::new(through.clone())
                .field(owner_key_name.clone(), key_like(&owner_key).primary())
                .field(target_key_name.clone(), key_like(&target_key).primary())
                .relation(
                    lower_camel(&owner),
                    RelationDefinition::belongs_to(owner.clone())
                        .foreign_key(owner_key_name)
                        .required()
                        .on_delete(ReferentialAction::Cascade),
                )
                .relation(
                    lower_camel(&relation.target),
                    RelationDefinition::belongs_to(relation.target.clone())
                        .foreign_key(target_key_name)
                        .required()
                        .on_delete(ReferentialAction::Cascade),
                );

            debug!(join = %through, owner = %owner, target = %relation.target, "synthesized join entity");
            resolved.insert(through, join);
        }
    }

    Ok(())
}

fn resolve_belongs_to(
    resolved: &mut BTreeMap<String, EntityDefinition>,
) -> SchemaResult<Vec<ForeignKeySpec>> {
    let mut foreign_keys = Vec::new();
    let names: Vec<String> = resolved.keys().cloned().collect();

    for name in names {
        let relations = match resolved.get(&name) {
            Some(entity) => sorted_relations(entity, &[RelationKind::BelongsTo]),
            None => continue,
        };
        let mut claimed = BTreeSet::new();

        for (relation_name, relation) in relations {
            let (key_name, key) = single_primary(resolved, &relation.target, &name, &relation_name)?;
            let fk_name = relation
                .foreign_key
                .clone()
                .unwrap_or_else(|| format!("{}Id", relation_name));

            if !claimed.insert(fk_name.clone()) {
                return Err(SchemaError::foreign_key_collision(
                    &name,
                    &fk_name,
                    &relation_name,
                    "another relation already uses this field",
                ));
            }

            let Some(entity) = resolved.get_mut(&name) else {
                continue;
            };

            match entity.fields.get(&fk_name) {
                Some(existing) if !is_compatible_key(existing, &key) => {
                    return Err(SchemaError::foreign_key_collision(
                        &name,
                        &fk_name,
                        &relation_name,
                        format!(
                            "explicit field has type `{}` but `{}.{}` is `{}`",
                            existing.field_type, relation.target, key_name, key.field_type
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    let mut field = key_like(&key);
                    field.required = relation.required;
                    entity.fields.insert(fk_name.clone(), field);
                }
            }

            foreign_keys.push(ForeignKeySpec {
                entity: name.clone(),
                relation: format!("{}.{}", name, relation_name),
                fields: vec![fk_name],
                target: relation.target.clone(),
                target_fields: vec![key_name],
                on_delete: relation.on_delete,
            });
        }
    }

    Ok(foreign_keys)
}

fn resolve_inverse_relations(
    resolved: &BTreeMap<String, EntityDefinition>,
    foreign_keys: &mut Vec<ForeignKeySpec>,
) -> SchemaResult<()> {
    for (name, entity) in resolved {
        for (relation_name, relation) in
            sorted_relations(entity, &[RelationKind::HasMany, RelationKind::HasOne])
        {
            let fk_name = relation
                .foreign_key
                .clone()
                .unwrap_or_else(|| format!("{}Id", lower_camel(name)));

            let has_field = resolved
                .get(&relation.target)
                .is_some_and(|t| t.fields.contains_key(&fk_name));
            if !has_field {
                return Err(SchemaError::UnresolvedRelation {
                    entity: name.clone(),
                    relation: relation_name,
                    target: relation.target.clone(),
                    foreign_key: fk_name,
                });
            }

            let constrained = foreign_keys
                .iter()
                .any(|fk| fk.entity == relation.target && fk.fields == [fk_name.as_str()]);
            if !constrained {
                let (key_name, _) = single_primary(resolved, name, name, &relation_name)?;
                foreign_keys.push(ForeignKeySpec {
                    entity: relation.target.clone(),
                    relation: format!("{}.{}", name, relation_name),
                    fields: vec![fk_name],
                    target: name.clone(),
                    target_fields: vec![key_name],
                    on_delete: relation.on_delete,
                });
            }
        }
    }

    Ok(())
}

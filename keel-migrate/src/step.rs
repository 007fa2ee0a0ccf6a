//! Migration steps.
//!
//! A step is one atomic structural change. Every step carries the full
//! definition of what it creates or removes, so a step list can be validated
//! against a table set and inverted without consulting any model.

use std::fmt;

use keel_schema::{Column, ForeignKey, Index, Table, Tables};
use serde::{Deserialize, Serialize};

/// One structural change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MigrationStep {
    /// Create a table with its columns. Indexes and foreign keys are separate steps.
    CreateTable { table: Table },
    /// Drop a table, carrying its columns so the step can be inverted.
    DropTable { table: Table },
    AddColumn { table: String, column: Column },
    DropColumn { table: String, column: Column },
    /// Change a column in place. `primary_key` is set exactly when the
    /// column's `primary` flag changes.
    AlterColumn {
        table: String,
        from: Column,
        to: Column,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        primary_key: Option<PrimaryKeyChange>,
    },
    AddIndex { table: String, index: Index },
    DropIndex { table: String, index: Index },
    AddForeignKey { table: String, foreign_key: ForeignKey },
    DropForeignKey { table: String, foreign_key: ForeignKey },
}

/// The table's full primary key around a [`MigrationStep::AlterColumn`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyChange {
    pub before: Vec<String>,
    pub after: Vec<String>,
}

impl PrimaryKeyChange {
    /// The key change of altering `to` in `table`.
    pub fn of(table: &Table, to: &Column) -> Self {
        let after = table
            .columns
            .values()
            .filter(|column| {
                if column.name == to.name {
                    to.primary
                } else {
                    column.primary
                }
            })
            .map(|column| column.name.clone())
            .collect();
        Self {
            before: table.primary_key().into_iter().map(str::to_string).collect(),
            after,
        }
    }

    fn inverse(self) -> Self {
        Self {
            before: self.after,
            after: self.before,
        }
    }
}

/// Execution phase of a step. Steps are ordered by phase first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepPhase {
    DropForeignKey,
    DropIndex,
    DropColumn,
    DropTable,
    CreateTable,
    AddColumn,
    AlterColumn,
    AddIndex,
    AddForeignKey,
}

/// The object a step touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepTarget {
    Table(String),
    Column { table: String, column: String },
    Index { table: String, name: String },
    ForeignKey { table: String, name: String },
}

impl StepTarget {
    /// Table the target belongs to.
    pub fn table(&self) -> &str {
        match self {
            Self::Table(table)
            | Self::Column { table, .. }
            | Self::Index { table, .. }
            | Self::ForeignKey { table, .. } => table,
        }
    }

    /// Column or constraint name, if narrower than the table.
    pub fn object(&self) -> Option<&str> {
        match self {
            Self::Table(_) => None,
            Self::Column { column, .. } => Some(column),
            Self::Index { name, .. } | Self::ForeignKey { name, .. } => Some(name),
        }
    }
}

impl MigrationStep {
    /// Table this step operates on.
    pub fn table_name(&self) -> &str {
        match self {
            Self::CreateTable { table } | Self::DropTable { table } => &table.name,
            Self::AddColumn { table, .. }
            | Self::DropColumn { table, .. }
            | Self::AlterColumn { table, .. }
            | Self::AddIndex { table, .. }
            | Self::DropIndex { table, .. }
            | Self::AddForeignKey { table, .. }
            | Self::DropForeignKey { table, .. } => table,
        }
    }

    /// The object this step creates, removes or changes.
    pub fn target(&self) -> StepTarget {
        let table = self.table_name().to_string();
        match self {
            Self::CreateTable { .. } | Self::DropTable { .. } => StepTarget::Table(table),
            Self::AddColumn { column, .. } | Self::DropColumn { column, .. } => StepTarget::Column {
                table,
                column: column.name.clone(),
            },
            Self::AlterColumn { to, .. } => StepTarget::Column {
                table,
                column: to.name.clone(),
            },
            Self::AddIndex { index, .. } | Self::DropIndex { index, .. } => StepTarget::Index {
                table,
                name: index.name.clone(),
            },
            Self::AddForeignKey { foreign_key, .. } | Self::DropForeignKey { foreign_key, .. } => {
                StepTarget::ForeignKey {
                    table,
                    name: foreign_key.name.clone(),
                }
            }
        }
    }

    /// Execution phase.
    pub fn phase(&self) -> StepPhase {
        match self {
            Self::DropForeignKey { .. } => StepPhase::DropForeignKey,
            Self::DropIndex { .. } => StepPhase::DropIndex,
            Self::DropColumn { .. } => StepPhase::DropColumn,
            Self::DropTable { .. } => StepPhase::DropTable,
            Self::CreateTable { .. } => StepPhase::CreateTable,
            Self::AddColumn { .. } => StepPhase::AddColumn,
            Self::AlterColumn { .. } => StepPhase::AlterColumn,
            Self::AddIndex { .. } => StepPhase::AddIndex,
            Self::AddForeignKey { .. } => StepPhase::AddForeignKey,
        }
    }

    /// Whether the step can lose data.
    pub fn is_destructive(&self) -> bool {
        match self {
            Self::DropTable { .. } | Self::DropColumn { .. } => true,
            Self::AlterColumn { from, to, .. } => from.sql_type != to.sql_type,
            _ => false,
        }
    }

    /// The structurally inverse step.
    pub fn inverse(&self) -> Self {
        match self.clone() {
            Self::CreateTable { table } => Self::DropTable { table },
            Self::DropTable { table } => Self::CreateTable { table },
            Self::AddColumn { table, column } => Self::DropColumn { table, column },
            Self::DropColumn { table, column } => Self::AddColumn { table, column },
            Self::AlterColumn {
                table,
                from,
                to,
                primary_key,
            } => Self::AlterColumn {
                table,
                from: to,
                to: from,
                primary_key: primary_key.map(PrimaryKeyChange::inverse),
            },
            Self::AddIndex { table, index } => Self::DropIndex { table, index },
            Self::DropIndex { table, index } => Self::AddIndex { table, index },
            Self::AddForeignKey { table, foreign_key } => Self::DropForeignKey { table, foreign_key },
            Self::DropForeignKey { table, foreign_key } => Self::AddForeignKey { table, foreign_key },
        }
    }

    /// Apply the step to a table set, checking that everything it depends on exists.
    ///
    /// On error the table set is left unchanged and the reason is returned.
    pub fn apply_to(&self, tables: &mut Tables) -> Result<(), String> {
        match self {
            Self::CreateTable { table } => {
                if tables.contains_key(&table.name) {
                    return Err(format!("table `{}` already exists", table.name));
                }
                tables.insert(table.name.clone(), table.clone());
            }
            Self::DropTable { table } => {
                let current = existing_table(tables, &table.name)?;
                if !current.indexes.is_empty() || !current.foreign_keys.is_empty() {
                    return Err(format!(
                        "table `{}` still has indexes or foreign keys",
                        table.name
                    ));
                }
                if current.columns != table.columns {
                    return Err(format!("table `{}` has different columns", table.name));
                }
                if let Some(referrer) = referencing_table(tables, &table.name, None) {
                    return Err(format!(
                        "table `{}` is referenced by a foreign key on `{}`",
                        table.name, referrer
                    ));
                }
                tables.remove(&table.name);
            }
            Self::AddColumn { table, column } => {
                let current = existing_table_mut(tables, table)?;
                if current.columns.contains_key(&column.name) {
                    return Err(format!("column `{}.{}` already exists", table, column.name));
                }
                current.columns.insert(column.name.clone(), column.clone());
            }
            Self::DropColumn { table, column } => {
                let current = existing_table(tables, table)?;
                match current.column(&column.name) {
                    None => return Err(format!("column `{}.{}` does not exist", table, column.name)),
                    Some(existing) if existing != column => {
                        return Err(format!("column `{}.{}` has a different definition", table, column.name));
                    }
                    Some(_) => {}
                }
                if let Some(index) = current.indexes.iter().find(|i| i.columns.contains(&column.name)) {
                    return Err(format!(
                        "column `{}.{}` is used by index `{}`",
                        table, column.name, index.name
                    ));
                }
                if let Some(fk) = current.foreign_keys.iter().find(|fk| fk.columns.contains(&column.name)) {
                    return Err(format!(
                        "column `{}.{}` is used by foreign key `{}`",
                        table, column.name, fk.name
                    ));
                }
                if let Some(referrer) = referencing_table(tables, table, Some(&column.name)) {
                    return Err(format!(
                        "column `{}.{}` is referenced by a foreign key on `{}`",
                        table, column.name, referrer
                    ));
                }
                if let Some(current) = tables.get_mut(table) {
                    current.columns.remove(&column.name);
                }
            }
            Self::AlterColumn {
                table,
                from,
                to,
                primary_key,
            } => {
                if from.name != to.name {
                    return Err(format!(
                        "cannot rename column `{}` to `{}` with an alter",
                        from.name, to.name
                    ));
                }
                let current = existing_table_mut(tables, table)?;
                match current.columns.get(&from.name) {
                    None => return Err(format!("column `{}.{}` does not exist", table, from.name)),
                    Some(existing) if existing != from => {
                        return Err(format!(
                            "column `{}.{}` does not match the expected definition",
                            table, from.name
                        ));
                    }
                    Some(_) => {}
                }
                let expected = if from.primary != to.primary {
                    Some(PrimaryKeyChange::of(current, to))
                } else {
                    None
                };
                if *primary_key != expected {
                    return Err(format!(
                        "primary key change on `{}` does not match the table's key",
                        table
                    ));
                }
                current.columns.insert(to.name.clone(), to.clone());
            }
            Self::AddIndex { table, index } => {
                let current = existing_table_mut(tables, table)?;
                if current.index(&index.name).is_some() {
                    return Err(format!("index `{}` already exists on `{}`", index.name, table));
                }
                if let Some(missing) = index.columns.iter().find(|c| !current.columns.contains_key(*c)) {
                    return Err(format!(
                        "index `{}` references missing column `{}.{}`",
                        index.name, table, missing
                    ));
                }
                current.indexes.push(index.clone());
            }
            Self::DropIndex { table, index } => {
                let current = existing_table_mut(tables, table)?;
                let Some(position) = current.indexes.iter().position(|i| i.name == index.name) else {
                    return Err(format!("index `{}` does not exist on `{}`", index.name, table));
                };
                current.indexes.remove(position);
            }
            Self::AddForeignKey { table, foreign_key } => {
                check_foreign_key(tables, table, foreign_key)?;
                let current = existing_table_mut(tables, table)?;
                current.foreign_keys.push(foreign_key.clone());
            }
            Self::DropForeignKey { table, foreign_key } => {
                let current = existing_table_mut(tables, table)?;
                let Some(position) = current
                    .foreign_keys
                    .iter()
                    .position(|fk| fk.name == foreign_key.name)
                else {
                    return Err(format!(
                        "foreign key `{}` does not exist on `{}`",
                        foreign_key.name, table
                    ));
                };
                current.foreign_keys.remove(position);
            }
        }
        Ok(())
    }
}

fn existing_table<'a>(tables: &'a Tables, name: &str) -> Result<&'a Table, String> {
    tables
        .get(name)
        .ok_or_else(|| format!("table `{}` does not exist", name))
}

fn existing_table_mut<'a>(tables: &'a mut Tables, name: &str) -> Result<&'a mut Table, String> {
    tables
        .get_mut(name)
        .ok_or_else(|| format!("table `{}` does not exist", name))
}

/// Another table with a foreign key into `table` (optionally into one column).
fn referencing_table<'a>(tables: &'a Tables, table: &str, column: Option<&str>) -> Option<&'a str> {
    tables
        .values()
        .filter(|t| column.is_some() || t.name != table)
        .find(|t| {
            t.foreign_keys.iter().any(|fk| {
                fk.referenced_table == table
                    && column.is_none_or(|c| fk.referenced_columns.iter().any(|rc| rc == c))
            })
        })
        .map(|t| t.name.as_str())
}

fn check_foreign_key(tables: &Tables, table: &str, foreign_key: &ForeignKey) -> Result<(), String> {
    let current = existing_table(tables, table)?;
    if current.foreign_key(&foreign_key.name).is_some() {
        return Err(format!(
            "foreign key `{}` already exists on `{}`",
            foreign_key.name, table
        ));
    }
    if foreign_key.columns.is_empty() || foreign_key.columns.len() != foreign_key.referenced_columns.len() {
        return Err(format!(
            "foreign key `{}` must pair each column with one referenced column",
            foreign_key.name
        ));
    }
    if let Some(missing) = foreign_key.columns.iter().find(|c| !current.columns.contains_key(*c)) {
        return Err(format!(
            "foreign key `{}` uses missing column `{}.{}`",
            foreign_key.name, table, missing
        ));
    }

    let Some(referenced) = tables.get(&foreign_key.referenced_table) else {
        return Err(format!(
            "foreign key `{}` references missing table `{}`",
            foreign_key.name, foreign_key.referenced_table
        ));
    };
    if let Some(missing) = foreign_key
        .referenced_columns
        .iter()
        .find(|c| !referenced.columns.contains_key(*c))
    {
        return Err(format!(
            "foreign key `{}` references missing column `{}.{}`",
            foreign_key.name, foreign_key.referenced_table, missing
        ));
    }
    Ok(())
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateTable { table } => write!(f, "CreateTable {}", table.name),
            Self::DropTable { table } => write!(f, "DropTable {}", table.name),
            Self::AddColumn { table, column } => write!(f, "AddColumn {}.{}", table, column.name),
            Self::DropColumn { table, column } => write!(f, "DropColumn {}.{}", table, column.name),
            Self::AlterColumn { table, to, .. } => write!(f, "AlterColumn {}.{}", table, to.name),
            Self::AddIndex { table, index } => write!(f, "AddIndex {} on {}", index.name, table),
            Self::DropIndex { table, index } => write!(f, "DropIndex {} on {}", index.name, table),
            Self::AddForeignKey { table, foreign_key } => {
                write!(f, "AddForeignKey {} on {}", foreign_key.name, table)
            }
            Self::DropForeignKey { table, foreign_key } => {
                write!(f, "DropForeignKey {} on {}", foreign_key.name, table)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn users() -> Table {
        Table::new("users")
            .with_column(Column::new("id", "UUID").primary())
            .with_column(Column::new("email", "VARCHAR(255)").not_null())
    }

    fn posts() -> Table {
        Table::new("posts")
            .with_column(Column::new("id", "INTEGER").primary())
            .with_column(Column::new("authorId", "UUID"))
    }

    fn author_fk() -> ForeignKey {
        ForeignKey {
            name: "posts_authorId_fkey".to_string(),
            columns: vec!["authorId".to_string()],
            referenced_table: "users".to_string(),
            referenced_columns: vec!["id".to_string()],
            on_delete: None,
        }
    }

    fn with_tables(steps: &[MigrationStep]) -> Tables {
        let mut tables = Tables::new();
        for step in steps {
            step.apply_to(&mut tables).unwrap();
        }
        tables
    }

    #[test]
    fn test_serde_shape() {
        let step = MigrationStep::AddColumn {
            table: "users".to_string(),
            column: Column::new("name", "VARCHAR(255)"),
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "addColumn");
        assert_eq!(json["table"], "users");
        assert_eq!(json["column"]["name"], "name");
        assert_eq!(json["column"]["nullable"], true);

        let fk = MigrationStep::AddForeignKey {
            table: "posts".to_string(),
            foreign_key: author_fk(),
        };
        let json = serde_json::to_value(&fk).unwrap();
        assert_eq!(json["type"], "addForeignKey");
        assert_eq!(json["foreignKey"]["referencedTable"], "users");

        let back: MigrationStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, fk);
    }

    #[test]
    fn test_inverse_pairs() {
        let create = MigrationStep::CreateTable { table: users() };
        assert_eq!(create.inverse(), MigrationStep::DropTable { table: users() });
        assert_eq!(create.inverse().inverse(), create);

        let alter = MigrationStep::AlterColumn {
            table: "users".to_string(),
            from: Column::new("email", "TEXT"),
            to: Column::new("email", "TEXT").not_null(),
            primary_key: None,
        };
        match alter.inverse() {
            MigrationStep::AlterColumn { from, to, .. } => {
                assert!(!from.nullable);
                assert!(to.nullable);
            }
            other => panic!("unexpected inverse {other}"),
        }
    }

    #[test]
    fn test_apply_and_inverse_restore_tables() {
        let mut tables = with_tables(&[MigrationStep::CreateTable { table: users() }]);
        let before = tables.clone();

        let steps = vec![
            MigrationStep::CreateTable { table: posts() },
            MigrationStep::AddIndex {
                table: "users".to_string(),
                index: Index::new("users", ["email"], true),
            },
            MigrationStep::AddForeignKey {
                table: "posts".to_string(),
                foreign_key: author_fk(),
            },
        ];
        for step in &steps {
            step.apply_to(&mut tables).unwrap();
        }
        assert_eq!(tables["posts"].foreign_keys.len(), 1);

        for step in steps.iter().rev() {
            step.inverse().apply_to(&mut tables).unwrap();
        }
        assert_eq!(tables, before);
    }

    #[test]
    fn test_primary_key_change_tracks_whole_key() {
        let memberships = Table::new("memberships")
            .with_column(Column::new("groupId", "UUID").primary())
            .with_column(Column::new("userId", "UUID").not_null());
        let mut tables = with_tables(&[MigrationStep::CreateTable { table: memberships }]);
        let before = tables.clone();

        let to = Column::new("userId", "UUID").primary();
        let key = PrimaryKeyChange::of(&tables["memberships"], &to);
        assert_eq!(key.before, vec!["groupId"]);
        assert_eq!(key.after, vec!["groupId", "userId"]);

        let alter = MigrationStep::AlterColumn {
            table: "memberships".to_string(),
            from: Column::new("userId", "UUID").not_null(),
            to: to.clone(),
            primary_key: Some(key),
        };
        alter.apply_to(&mut tables).unwrap();
        assert_eq!(tables["memberships"].primary_key(), vec!["groupId", "userId"]);

        alter.inverse().apply_to(&mut tables).unwrap();
        assert_eq!(tables, before);

        let unannotated = MigrationStep::AlterColumn {
            table: "memberships".to_string(),
            from: Column::new("userId", "UUID").not_null(),
            to,
            primary_key: None,
        };
        assert!(unannotated.apply_to(&mut tables).unwrap_err().contains("primary key"));
        assert_eq!(tables, before);
    }

    #[test]
    fn test_dependency_failures() {
        let mut tables = with_tables(&[MigrationStep::CreateTable { table: users() }]);

        let index_on_missing = MigrationStep::AddIndex {
            table: "users".to_string(),
            index: Index::new("users", ["name"], false),
        };
        let err = index_on_missing.apply_to(&mut tables).unwrap_err();
        assert!(err.contains("missing column"));

        let fk_to_missing_table = MigrationStep::AddForeignKey {
            table: "users".to_string(),
            foreign_key: ForeignKey {
                referenced_table: "accounts".to_string(),
                columns: vec!["id".to_string()],
                ..author_fk()
            },
        };
        assert!(fk_to_missing_table.apply_to(&mut tables).unwrap_err().contains("accounts"));

        let stale_alter = MigrationStep::AlterColumn {
            table: "users".to_string(),
            from: Column::new("email", "TEXT"),
            to: Column::new("email", "TEXT").not_null(),
            primary_key: None,
        };
        assert!(stale_alter.apply_to(&mut tables).is_err());
        assert_eq!(tables, with_tables(&[MigrationStep::CreateTable { table: users() }]));
    }

    #[test]
    fn test_drop_blocked_by_references() {
        let mut tables = with_tables(&[
            MigrationStep::CreateTable { table: users() },
            MigrationStep::CreateTable { table: posts() },
            MigrationStep::AddForeignKey {
                table: "posts".to_string(),
                foreign_key: author_fk(),
            },
        ]);

        let drop_users = MigrationStep::DropTable { table: users() };
        assert!(drop_users.apply_to(&mut tables).unwrap_err().contains("referenced"));

        let drop_author = MigrationStep::DropColumn {
            table: "posts".to_string(),
            column: Column::new("authorId", "UUID"),
        };
        assert!(drop_author.apply_to(&mut tables).unwrap_err().contains("foreign key"));
    }

    #[test]
    fn test_targets_and_phases() {
        let add = MigrationStep::AddColumn {
            table: "users".to_string(),
            column: Column::new("name", "TEXT"),
        };
        assert_eq!(
            add.target(),
            StepTarget::Column {
                table: "users".to_string(),
                column: "name".to_string()
            }
        );
        assert_eq!(add.target().object(), Some("name"));
        assert!(StepPhase::DropIndex < StepPhase::DropTable);
        assert!(StepPhase::CreateTable < StepPhase::AddForeignKey);
        assert!(!add.is_destructive());
        assert!(add.inverse().is_destructive());
        assert_eq!(add.to_string(), "AddColumn users.name");
    }
}

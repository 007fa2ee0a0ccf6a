//! SQL rendering for migration steps.

use keel_schema::{Column, ForeignKey, Generated, Index, Table};

use crate::step::{MigrationStep, PrimaryKeyChange};

/// Renders steps into statements for one database.
pub trait SqlDialect: Send + Sync {
    /// Dialect name, for logs.
    fn name(&self) -> &'static str;

    /// Statements for one step, in execution order.
    fn render(&self, step: &MigrationStep) -> Vec<String>;
}

/// SQL dialect for PostgreSQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn render(&self, step: &MigrationStep) -> Vec<String> {
        match step {
            MigrationStep::CreateTable { table } => vec![self.create_table(table)],
            MigrationStep::DropTable { table } => {
                vec![format!("DROP TABLE {};", quote(&table.name))]
            }
            MigrationStep::AddColumn { table, column } => vec![format!(
                "ALTER TABLE {} ADD COLUMN {};",
                quote(table),
                self.column_definition(column)
            )],
            MigrationStep::DropColumn { table, column } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {};",
                quote(table),
                quote(&column.name)
            )],
            MigrationStep::AlterColumn {
                table,
                from,
                to,
                primary_key,
            } => self.alter_column(table, from, to, primary_key.as_ref()),
            MigrationStep::AddIndex { table, index } => vec![self.create_index(table, index)],
            MigrationStep::DropIndex { index, .. } => {
                vec![format!("DROP INDEX {};", quote(&index.name))]
            }
            MigrationStep::AddForeignKey { table, foreign_key } => {
                vec![self.add_foreign_key(table, foreign_key)]
            }
            MigrationStep::DropForeignKey { table, foreign_key } => vec![format!(
                "ALTER TABLE {} DROP CONSTRAINT {};",
                quote(table),
                quote(&foreign_key.name)
            )],
        }
    }
}

impl PostgresDialect {
    /// Generate CREATE TABLE statement.
    fn create_table(&self, table: &Table) -> String {
        let mut columns: Vec<String> = table
            .columns
            .values()
            .map(|column| self.column_definition(column))
            .collect();

        let primary_key = table.primary_key();
        if !primary_key.is_empty() {
            let pk_cols: Vec<String> = primary_key.iter().map(|c| quote(c)).collect();
            columns.push(format!("PRIMARY KEY ({})", pk_cols.join(", ")));
        }

        format!(
            "CREATE TABLE {} (\n    {}\n);",
            quote(&table.name),
            columns.join(",\n    ")
        )
    }

    /// Generate column definition.
    fn column_definition(&self, column: &Column) -> String {
        let mut sql_type = column.sql_type.clone();
        if column.generated == Some(Generated::Increment) {
            // Replace type with SERIAL variants
            match column.sql_type.as_str() {
                "INTEGER" => sql_type = "SERIAL".to_string(),
                "BIGINT" => sql_type = "BIGSERIAL".to_string(),
                _ => {}
            }
        }

        let mut parts = vec![quote(&column.name), sql_type];

        if !column.nullable && !column.primary {
            parts.push("NOT NULL".to_string());
        }

        if let Some(default) = self.default_expression(column) {
            parts.push(format!("DEFAULT {}", default));
        }

        parts.join(" ")
    }

    fn default_expression(&self, column: &Column) -> Option<String> {
        if let Some(default) = &column.default {
            return Some(default.clone());
        }
        match column.generated {
            Some(Generated::Uuid) => Some("gen_random_uuid()".to_string()),
            Some(Generated::Now) => Some("CURRENT_TIMESTAMP".to_string()),
            Some(Generated::Increment) | None => None,
        }
    }

    /// Generate ALTER COLUMN statements.
    fn alter_column(
        &self,
        table: &str,
        from: &Column,
        to: &Column,
        primary_key: Option<&PrimaryKeyChange>,
    ) -> Vec<String> {
        let mut stmts = Vec::new();
        let prefix = format!("ALTER TABLE {} ALTER COLUMN {}", quote(table), quote(&to.name));

        if from.sql_type != to.sql_type {
            stmts.push(format!(
                "{} TYPE {} USING {}::{};",
                prefix,
                to.sql_type,
                quote(&to.name),
                to.sql_type
            ));
        }

        if from.nullable != to.nullable && !to.primary {
            if to.nullable {
                stmts.push(format!("{} DROP NOT NULL;", prefix));
            } else {
                stmts.push(format!("{} SET NOT NULL;", prefix));
            }
        }

        let (old_default, new_default) = (self.default_expression(from), self.default_expression(to));
        if old_default != new_default {
            match new_default {
                Some(default) => stmts.push(format!("{} SET DEFAULT {};", prefix, default)),
                None => stmts.push(format!("{} DROP DEFAULT;", prefix)),
            }
        }

        // The key is replaced as a whole under Postgres' default constraint name.
        if let Some(key) = primary_key {
            let constraint = quote(&format!("{}_pkey", table));
            if !key.before.is_empty() {
                stmts.push(format!(
                    "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
                    quote(table),
                    constraint
                ));
            }
            if !key.after.is_empty() {
                let cols: Vec<String> = key.after.iter().map(|c| quote(c)).collect();
                stmts.push(format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({});",
                    quote(table),
                    constraint,
                    cols.join(", ")
                ));
            }
        }

        stmts
    }

    /// Generate CREATE INDEX statement.
    fn create_index(&self, table: &str, index: &Index) -> String {
        let unique = if index.unique { "UNIQUE " } else { "" };
        let cols: Vec<String> = index.columns.iter().map(|c| quote(c)).collect();
        format!(
            "CREATE {}INDEX {} ON {} ({});",
            unique,
            quote(&index.name),
            quote(table),
            cols.join(", ")
        )
    }

    fn add_foreign_key(&self, table: &str, foreign_key: &ForeignKey) -> String {
        let cols: Vec<String> = foreign_key.columns.iter().map(|c| quote(c)).collect();
        let refs: Vec<String> = foreign_key
            .referenced_columns
            .iter()
            .map(|c| quote(c))
            .collect();
        let mut sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            quote(table),
            quote(&foreign_key.name),
            cols.join(", "),
            quote(&foreign_key.referenced_table),
            refs.join(", ")
        );
        if let Some(action) = foreign_key.on_delete {
            sql.push_str(&format!(" ON DELETE {}", action.as_sql()));
        }
        sql.push(';');
        sql
    }
}

/// Quote an identifier.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

//! Replaying migration chains against a database.
//!
//! State machine: start at `from_hash`; for each record check that it starts
//! at the current hash, run all of its statements in one transaction, and
//! advance to `to_hash` only after the commit succeeds. Any failure rolls the
//! transaction back and leaves the current hash where it was.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{MigrateResult, MigrationError};
use crate::record::MigrationRecord;
use crate::sql::{PostgresDialect, SqlDialect};

/// Transactional handle to a database. Opening connections is the caller's job.
#[async_trait]
pub trait SchemaConnection: Send {
    /// Begin a transaction.
    async fn begin(&mut self) -> MigrateResult<()>;

    /// Execute one DDL statement inside the open transaction.
    async fn execute(&mut self, statement: &str) -> MigrateResult<()>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> MigrateResult<()>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> MigrateResult<()>;
}

/// Applies migration records through an injected SQL dialect.
#[derive(Debug, Clone, Default)]
pub struct ReplayEngine<D: SqlDialect = PostgresDialect> {
    dialect: D,
}

impl ReplayEngine<PostgresDialect> {
    /// Create a replay engine for PostgreSQL.
    pub fn new() -> Self {
        Self::with_dialect(PostgresDialect)
    }
}

impl<D: SqlDialect> ReplayEngine<D> {
    /// Create a replay engine with a dialect.
    pub fn with_dialect(dialect: D) -> Self {
        Self { dialect }
    }

    /// The dialect in use.
    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    /// All statements of a record, in order.
    pub fn statements(&self, record: &MigrationRecord) -> Vec<String> {
        record
            .steps
            .iter()
            .flat_map(|step| self.dialect.render(step))
            .collect()
    }

    /// Apply one record in one transaction. Returns the new current hash.
    pub async fn apply<C>(
        &self,
        conn: &mut C,
        record: &MigrationRecord,
        current_hash: &str,
    ) -> MigrateResult<String>
    where
        C: SchemaConnection + ?Sized,
    {
        if record.from_hash != current_hash {
            return Err(MigrationError::HashMismatch {
                migration: record.id.clone(),
                expected: current_hash.to_string(),
                actual: record.from_hash.clone(),
            });
        }

        let failed = |step_index: Option<usize>, source: MigrationError| MigrationError::ReplayFailed {
            migration: record.id.clone(),
            from_hash: record.from_hash.clone(),
            to_hash: record.to_hash.clone(),
            step_index,
            source: Box::new(source),
        };

        conn.begin().await.map_err(|e| failed(None, e))?;

        for (step_index, step) in record.steps.iter().enumerate() {
            for statement in self.dialect.render(step) {
                debug!(migration = %record.id, step = step_index, sql = %statement, "executing");
                if let Err(err) = conn.execute(&statement).await {
                    abort(conn, record).await;
                    return Err(failed(Some(step_index), err));
                }
            }
        }

        if let Err(err) = conn.commit().await {
            abort(conn, record).await;
            return Err(failed(None, err));
        }

        info!(
            migration = %record.id,
            from = %record.from_hash,
            to = %record.to_hash,
            steps = record.steps.len(),
            dialect = self.dialect.name(),
            "applied migration"
        );
        Ok(record.to_hash.clone())
    }

    /// Apply records in chain order starting at `from_hash`. Returns the final hash.
    pub async fn replay<C>(
        &self,
        conn: &mut C,
        records: &[MigrationRecord],
        from_hash: &str,
    ) -> MigrateResult<String>
    where
        C: SchemaConnection + ?Sized,
    {
        let mut current = from_hash.to_string();
        for record in records {
            current = self.apply(conn, record, &current).await?;
        }
        Ok(current)
    }

    /// Undo records newest first, starting at `current_hash` (the `to_hash` of
    /// the last record). Returns the final hash.
    pub async fn rollback<C>(
        &self,
        conn: &mut C,
        records: &[MigrationRecord],
        current_hash: &str,
    ) -> MigrateResult<String>
    where
        C: SchemaConnection + ?Sized,
    {
        let mut current = current_hash.to_string();
        for record in records.iter().rev() {
            let inverse = record.inverse()?;
            current = self.apply(conn, &inverse, &current).await?;
        }
        Ok(current)
    }
}

async fn abort<C>(conn: &mut C, record: &MigrationRecord)
where
    C: SchemaConnection + ?Sized,
{
    if let Err(err) = conn.rollback().await {
        warn!(migration = %record.id, error = %err, "rollback after failure also failed");
    }
}

/// Replay `migrations` from `from_hash` with the PostgreSQL dialect.
pub async fn replay_migrations<C>(
    conn: &mut C,
    migrations: &[MigrationRecord],
    from_hash: &str,
) -> MigrateResult<String>
where
    C: SchemaConnection + ?Sized,
{
    ReplayEngine::new().replay(conn, migrations, from_hash).await
}

/// Roll back `migrations` from `current_hash` with the PostgreSQL dialect.
pub async fn rollback_migrations<C>(
    conn: &mut C,
    migrations: &[MigrationRecord],
    current_hash: &str,
) -> MigrateResult<String>
where
    C: SchemaConnection + ?Sized,
{
    ReplayEngine::new().rollback(conn, migrations, current_hash).await
}

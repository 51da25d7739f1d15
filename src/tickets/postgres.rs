//! `PostgreSQL` ticket store.
//!
//! Tickets are stored as JSONB next to a `version` column. Updates are conditional on the
//! version the caller read, and guarded commits take a transaction-scoped advisory lock
//! on the principal so session checks are serialized across instances.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow, types::Json};
use tracing::{Instrument, debug, info_span};

use super::{
    Ticket, TicketKind,
    store::{CommitOutcome, StoreError, TicketBatch, TicketStore},
};

const SCHEMA: &str = include_str!("../../sql/schema.sql");

#[derive(Debug, Clone)]
pub struct PostgresTicketStore {
    pool: PgPool,
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn decode_row(row: &PgRow) -> Result<Ticket, StoreError> {
    row.try_get::<Json<Ticket>, _>("body")
        .map(|json| json.0)
        .map_err(map_sqlx)
}

fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Backend("ticket version overflow".to_string()))
}

impl PostgresTicketStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `tickets` table and indexes if missing.
    ///
    /// # Errors
    /// Returns an error if the DDL cannot be executed.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "CREATE");
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn write(
        tx: &mut Transaction<'_, Postgres>,
        ticket: &Ticket,
    ) -> Result<bool, StoreError> {
        let mut stored = ticket.clone();
        stored.version += 1;
        let new_version = to_db_version(stored.version)?;

        let result = if ticket.version == 0 {
            let span = info_span!("db.query", db.system = "postgresql", db.operation = "INSERT");
            sqlx::query(
                r"
                INSERT INTO tickets (id, kind, principal_id, granting_ticket_id, version, expires_at, body)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(&stored.id)
            .bind(stored.kind().prefix())
            .bind(&stored.principal_id)
            .bind(stored.granting_ticket_id.as_deref())
            .bind(new_version)
            .bind(stored.expires_at())
            .bind(Json(&stored))
            .execute(&mut **tx)
            .instrument(span)
            .await
        } else {
            let span = info_span!("db.query", db.system = "postgresql", db.operation = "UPDATE");
            sqlx::query(
                r"
                UPDATE tickets
                SET version = $2, expires_at = $3, body = $4
                WHERE id = $1 AND version = $5
                ",
            )
            .bind(&stored.id)
            .bind(new_version)
            .bind(stored.expires_at())
            .bind(Json(&stored))
            .bind(to_db_version(ticket.version)?)
            .execute(&mut **tx)
            .instrument(span)
            .await
        };

        Ok(result.map_err(map_sqlx)?.rows_affected() == 1)
    }
}

#[async_trait]
impl TicketStore for PostgresTicketStore {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    async fn get(&self, id: &str) -> Result<Option<Ticket>, StoreError> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "SELECT");
        let row = sqlx::query("SELECT body FROM tickets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn commit(&self, batch: TicketBatch) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        if let Some(guard) = &batch.guard {
            let span = info_span!("db.query", db.system = "postgresql", db.operation = "LOCK");
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(guard.principal_id())
                .execute(&mut *tx)
                .instrument(span)
                .await
                .map_err(map_sqlx)?;

            let span = info_span!("db.query", db.system = "postgresql", db.operation = "SELECT");
            let rows = sqlx::query("SELECT body FROM tickets WHERE principal_id = $1 AND kind = $2")
                .bind(guard.principal_id())
                .bind(TicketKind::TicketGranting.prefix())
                .fetch_all(&mut *tx)
                .instrument(span)
                .await
                .map_err(map_sqlx)?;
            let sessions = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;

            if guard.is_violated(&sessions) {
                debug!(principal = guard.principal_id(), "session guard rejected commit");
                tx.rollback().await.map_err(map_sqlx)?;
                return Ok(CommitOutcome::SessionRejected);
            }
        }

        for ticket in &batch.writes {
            if !Self::write(&mut tx, ticket).await? {
                tx.rollback().await.map_err(map_sqlx)?;
                return Ok(CommitOutcome::Stale(ticket.id.clone()));
            }
        }

        if !batch.deletes.is_empty() {
            let span = info_span!("db.query", db.system = "postgresql", db.operation = "DELETE");
            sqlx::query("DELETE FROM tickets WHERE id = ANY($1)")
                .bind(batch.deletes.as_slice())
                .execute(&mut *tx)
                .instrument(span)
                .await
                .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(CommitOutcome::Committed)
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "DELETE");
        let result = sqlx::query("DELETE FROM tickets WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(map_sqlx)?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn tickets(&self, kind: Option<TicketKind>) -> Result<Vec<Ticket>, StoreError> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "SELECT");
        let rows = sqlx::query("SELECT body FROM tickets WHERE $1::text IS NULL OR kind = $1")
            .bind(kind.map(TicketKind::prefix))
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(decode_row).collect()
    }

    async fn tickets_for_principal(&self, principal_id: &str) -> Result<Vec<Ticket>, StoreError> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "SELECT");
        let rows = sqlx::query("SELECT body FROM tickets WHERE principal_id = $1")
            .bind(principal_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(decode_row).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_are_transient() {
        assert!(map_sqlx(sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx(sqlx::Error::PoolClosed).is_transient());
        assert!(!map_sqlx(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn schema_creates_ticket_table() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS tickets"));
        assert!(SCHEMA.contains("version"));
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::ServiceSettings;
use crate::outbox::{OutboxRow, OutboxStore};

/// SQLx-based outbox driver for PostgreSQL.
///
/// Writes into the table named by the service settings. The table is expected
/// to exist with the columns `id uuid`, `aggregate_type text`,
/// `aggregate_id text`, `message_type text`, `payload jsonb` and
/// `created_at timestamptz default now()`.
#[derive(Debug, Clone)]
pub struct PgOutbox {
    insert_sql: String,
    delete_sql: String,
}

impl PgOutbox {
    /// Creates a driver for the outbox table in `settings`.
    ///
    /// The settings are expected to be validated.
    pub fn new(settings: &ServiceSettings) -> Self {
        let table = settings.qualified_table();
        Self {
            insert_sql: format!(
                "INSERT INTO {table} (id, aggregate_type, aggregate_id, message_type, payload) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING created_at"
            ),
            delete_sql: format!("DELETE FROM {table} WHERE id = $1"),
        }
    }
}

#[async_trait]
impl OutboxStore for PgOutbox {
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all, fields(id = %row.id))]
    async fn insert_message(
        &self,
        row: &OutboxRow,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<Option<DateTime<Utc>>, tower::BoxError> {
        let created_at = sqlx::query_scalar(&self.insert_sql)
            .bind(row.id)
            .bind(&row.aggregate_type)
            .bind(&row.aggregate_id)
            .bind(&row.message_type)
            .bind(&row.payload)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(created_at)
    }

    async fn delete_message(
        &self,
        id: Uuid,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), tower::BoxError> {
        sqlx::query(&self.delete_sql)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

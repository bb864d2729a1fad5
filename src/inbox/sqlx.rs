use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::{MAX_RETRIES_LIMIT, ServiceSettings};
use crate::inbox::{InboxRecord, InboxStore};
use crate::message::InboxMessage;
use crate::transaction::Transactional;

/// SQLx-based inbox driver for PostgreSQL.
///
/// The table is expected to have the outbox columns plus
/// `processed_at timestamptz null` and `retries smallint default 0`, with
/// `id` as primary key.
#[derive(Debug, Clone)]
pub struct PgInbox {
    pool: PgPool,
    insert_sql: String,
    find_sql: String,
    processed_sql: String,
    retries_sql: String,
}

impl PgInbox {
    /// Creates a driver for the inbox table in `settings`.
    ///
    /// The settings are expected to be validated.
    pub fn new(pool: PgPool, settings: &ServiceSettings) -> Self {
        let table = settings.qualified_table();
        Self {
            pool,
            insert_sql: format!(
                "INSERT INTO {table} \
                 (id, aggregate_type, aggregate_id, message_type, payload, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (id) DO NOTHING"
            ),
            find_sql: format!("SELECT processed_at, retries FROM {table} WHERE id = $1 FOR UPDATE"),
            processed_sql: format!("UPDATE {table} SET processed_at = now() WHERE id = $1"),
            // The counter stops one past the largest budget instead of overflowing.
            retries_sql: format!(
                "UPDATE {table} SET retries = LEAST(retries, {MAX_RETRIES_LIMIT}) + 1 \
                 WHERE id = $1 RETURNING retries"
            ),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Transactional for PgInbox {
    type Transaction = sqlx::Transaction<'static, sqlx::Postgres>;

    async fn begin(&self) -> Result<Self::Transaction, tower::BoxError> {
        Transactional::begin(&self.pool).await
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), tower::BoxError> {
        Transactional::commit(&self.pool, tx).await
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), tower::BoxError> {
        Transactional::rollback(&self.pool, tx).await
    }
}

#[async_trait]
impl InboxStore for PgInbox {
    #[tracing::instrument(skip_all, fields(id = %message.id))]
    async fn insert_message(
        &self,
        message: &InboxMessage,
        tx: &mut Self::Transaction,
    ) -> Result<bool, tower::BoxError> {
        let result = sqlx::query(&self.insert_sql)
            .bind(message.id)
            .bind(&message.aggregate_type)
            .bind(&message.aggregate_id)
            .bind(&message.message_type)
            .bind(&message.payload)
            .bind(message.created_at)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_message(
        &self,
        id: Uuid,
        tx: &mut Self::Transaction,
    ) -> Result<Option<InboxRecord>, tower::BoxError> {
        let row: Option<(Option<DateTime<Utc>>, i16)> = sqlx::query_as(&self.find_sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(|(processed_at, retries)| InboxRecord {
            processed_at,
            retries,
        }))
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        tx: &mut Self::Transaction,
    ) -> Result<bool, tower::BoxError> {
        let result = sqlx::query(&self.processed_sql)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn increment_retries(
        &self,
        id: Uuid,
        tx: &mut Self::Transaction,
    ) -> Result<Option<i16>, tower::BoxError> {
        let retries = sqlx::query_scalar(&self.retries_sql)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::{Inbox, InboxErrorKind, NackOutcome, ack, nack, verify};
    use serde_json::json;

    fn settings() -> ServiceSettings {
        ServiceSettings {
            db_schema: "public".into(),
            db_table: "inbox".into(),
            postgres_pub: "inbox_pub".into(),
            postgres_slot: "inbox_slot".into(),
        }
    }

    fn message() -> InboxMessage {
        InboxMessage {
            id: Uuid::new_v4(),
            aggregate_type: "movie".into(),
            aggregate_id: "42".into(),
            message_type: "movie_created".into(),
            payload: json!({ "title": "Heat" }),
            created_at: Utc::now(),
            processed_at: None,
            retries: 0,
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires PostgreSQL"]
    async fn verify_ack_and_nack_update_the_row(pool: PgPool) {
        let backend = PgInbox::new(pool.clone(), &settings());
        let inbox = Inbox::new(backend.clone());
        let msg = message();
        inbox.store(msg.clone()).await.unwrap();
        inbox.store(msg.clone()).await.unwrap();

        let mut tx = backend.begin().await.unwrap();
        assert_eq!(nack(&backend, &msg, &mut tx, 5).await.unwrap(), NackOutcome::Retry);
        verify(&backend, &msg, &mut tx, 5).await.unwrap();
        ack(&backend, &msg, &mut tx).await.unwrap();
        backend.commit(tx).await.unwrap();

        let mut tx = backend.begin().await.unwrap();
        let err = verify(&backend, &msg, &mut tx, 5).await.unwrap_err();
        assert!(matches!(err.kind(), InboxErrorKind::AlreadyProcessed));
        backend.rollback(tx).await.unwrap();

        let (count, retries): (i64, i16) =
            sqlx::query_as("SELECT COUNT(*), MAX(retries) FROM public.inbox")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!((count, retries), (1, 1));
    }
}

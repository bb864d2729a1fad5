use async_stream::stream;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;

use crate::changelog::{ChangeEvent, ChangeKind, ChangeLog, ChangeLogError, Lsn};
use crate::config::ServiceSettings;

/// Logical replication slot read through the SQL interface.
///
/// Each subscription creates the slot when missing, then peeks its pending
/// changes, decoded by the `wal2json` output plugin (format version 2), and
/// ends after the batch.
/// Acknowledging advances the slot with `pg_replication_slot_advance`.
///
/// Events are emitted once their transaction's commit was seen and carry the
/// commit position, so acknowledging an event skips its whole transaction on
/// the next subscription. Transactions that touched none of the watched rows
/// still produce a commit marker, which lets the slot advance over them.
#[derive(Clone)]
pub struct PgLogicalSlot {
    pool: PgPool,
    slot: String,
    publication: String,
    table_filter: String,
    batch_size: i32,
}

impl PgLogicalSlot {
    /// Creates a slot reader for the table named in `settings`.
    ///
    /// The pool must connect as a role with replication permission.
    pub fn new(pool: PgPool, settings: &ServiceSettings) -> Self {
        Self {
            pool,
            slot: settings.postgres_slot.clone(),
            publication: settings.postgres_pub.clone(),
            table_filter: settings.qualified_table(),
            batch_size: 1000,
        }
    }

    /// Sets the maximum number of changes read per subscription.
    pub fn with_batch_size(mut self, size: i32) -> Self {
        self.batch_size = size;
        self
    }

    /// Creates the slot with the `wal2json` plugin if it does not exist yet.
    #[tracing::instrument(skip_all, fields(slot = %self.slot))]
    pub async fn ensure_slot(&self) -> Result<(), ChangeLogError> {
        sqlx::query(
            "SELECT pg_create_logical_replication_slot($1, 'wal2json') \
             WHERE NOT EXISTS (SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
        )
        .bind(&self.slot)
        .execute(&self.pool)
        .await
        .map_err(ChangeLogError::subscription)?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(slot = %self.slot))]
    async fn peek(&self) -> Result<Vec<(Lsn, String)>, ChangeLogError> {
        let published: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_publication WHERE pubname = $1)")
                .bind(&self.publication)
                .fetch_one(&self.pool)
                .await
                .map_err(ChangeLogError::subscription)?;
        if !published {
            return Err(ChangeLogError::subscription(format!(
                "publication {} does not exist",
                self.publication
            )));
        }

        let rows = sqlx::query(
            "SELECT lsn::text AS lsn, data FROM pg_logical_slot_peek_changes($1, NULL, $2, \
             'format-version', '2', 'include-transaction', 'true', \
             'actions', 'insert', 'add-tables', $3)",
        )
        .bind(&self.slot)
        .bind(self.batch_size)
        .bind(&self.table_filter)
        .fetch_all(&self.pool)
        .await
        .map_err(ChangeLogError::subscription)?;

        rows.into_iter()
            .map(|row| -> Result<(Lsn, String), ChangeLogError> {
                let lsn: String = row.try_get("lsn").map_err(ChangeLogError::subscription)?;
                let data: String = row.try_get("data").map_err(ChangeLogError::subscription)?;
                Ok((lsn.parse()?, data))
            })
            .collect()
    }
}

#[async_trait]
impl ChangeLog for PgLogicalSlot {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<ChangeEvent, ChangeLogError>>, ChangeLogError> {
        let rows = tokio::select! {
            biased;
            _ = cancel.cancelled() => Vec::new(),
            rows = async {
                self.ensure_slot().await?;
                self.peek().await
            } => rows?,
        };
        tracing::trace!(changes = rows.len(), "Peeked replication slot");

        Ok(Box::pin(stream! {
            let mut decoder = TransactionDecoder::default();
            for (lsn, data) in rows {
                if cancel.is_cancelled() {
                    break;
                }
                match decoder.push(lsn, &data) {
                    Ok(events) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        }))
    }

    #[tracing::instrument(skip(self), fields(slot = %self.slot))]
    async fn acknowledge(&self, lsn: Lsn) -> Result<(), ChangeLogError> {
        sqlx::query(
            "SELECT pg_replication_slot_advance($1, $2::pg_lsn) FROM pg_replication_slots \
             WHERE slot_name = $1 AND confirmed_flush_lsn < $2::pg_lsn",
        )
        .bind(&self.slot)
        .bind(lsn.to_string())
        .execute(&self.pool)
        .await
        .map_err(ChangeLogError::subscription)?;
        Ok(())
    }
}

/// One `wal2json` format-version 2 record.
#[derive(Debug, Deserialize)]
struct Wal2JsonRecord {
    action: String,
    #[serde(default)]
    schema: String,
    #[serde(default)]
    table: String,
    #[serde(default)]
    columns: Vec<Wal2JsonColumn>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonColumn {
    name: String,
    value: Value,
}

/// Buffers the changes of a transaction until its commit record.
#[derive(Default)]
struct TransactionDecoder {
    pending: Vec<(ChangeKind, String, String, Map<String, Value>)>,
}

impl TransactionDecoder {
    fn push(&mut self, lsn: Lsn, data: &str) -> Result<Vec<ChangeEvent>, ChangeLogError> {
        let record: Wal2JsonRecord = serde_json::from_str(data)
            .map_err(|e| ChangeLogError::decode(format!("invalid wal2json record: {e}")))?;
        let kind = match record.action.as_str() {
            "B" => {
                self.pending.clear();
                return Ok(Vec::new());
            }
            "C" if self.pending.is_empty() => {
                return Ok(vec![ChangeEvent::commit(lsn)]);
            }
            "C" => {
                return Ok(self
                    .pending
                    .drain(..)
                    .map(|(kind, schema, table, columns)| ChangeEvent {
                        lsn,
                        kind,
                        schema,
                        table,
                        columns,
                    })
                    .collect());
            }
            "I" => ChangeKind::Insert,
            "U" => ChangeKind::Update,
            "D" => ChangeKind::Delete,
            "T" => ChangeKind::Truncate,
            // Logical decoding messages carry no row data.
            "M" => return Ok(Vec::new()),
            other => {
                return Err(ChangeLogError::decode(format!(
                    "unknown wal2json action {other}"
                )));
            }
        };
        let columns = record
            .columns
            .into_iter()
            .map(|c| (c.name, c.value))
            .collect();
        self.pending
            .push((kind, record.schema, record.table, columns));
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emits_changes_with_the_commit_position() {
        let mut decoder = TransactionDecoder::default();

        assert!(decoder.push(Lsn(10), r#"{"action":"B"}"#).unwrap().is_empty());
        let insert = json!({
            "action": "I",
            "schema": "messaging",
            "table": "outbox",
            "columns": [
                { "name": "id", "type": "uuid", "value": "1b7c0d0e-3f9e-4a43-9c43-8f1b1b8f5b8a" },
                { "name": "payload", "type": "jsonb", "value": { "a": 1 } }
            ]
        });
        assert!(decoder.push(Lsn(11), &insert.to_string()).unwrap().is_empty());
        let events = decoder.push(Lsn(20), r#"{"action":"C"}"#).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].lsn, Lsn(20));
        assert!(events[0].is_insert_into("messaging", "outbox"));
        assert_eq!(events[0].columns["payload"], json!({ "a": 1 }));
    }

    #[test]
    fn incomplete_transactions_are_not_emitted() {
        let mut decoder = TransactionDecoder::default();
        decoder.push(Lsn(1), r#"{"action":"B"}"#).unwrap();
        decoder
            .push(
                Lsn(2),
                r#"{"action":"I","schema":"s","table":"t","columns":[]}"#,
            )
            .unwrap();
        decoder.push(Lsn(3), r#"{"action":"B"}"#).unwrap();

        let events = decoder.push(Lsn(4), r#"{"action":"C"}"#).unwrap();

        assert_eq!(events, vec![ChangeEvent::commit(Lsn(4))]);
    }

    #[test]
    fn unrelated_transactions_yield_commit_markers() {
        let mut decoder = TransactionDecoder::default();
        let mut events = Vec::new();
        for n in 0..600 {
            decoder.push(Lsn(2 * n), r#"{"action":"B"}"#).unwrap();
            events.extend(decoder.push(Lsn(2 * n + 1), r#"{"action":"C"}"#).unwrap());
        }

        assert_eq!(events.len(), 600);
        assert!(events.iter().all(|e| e.kind == ChangeKind::Commit));
        assert_eq!(events.last().map(|e| e.lsn), Some(Lsn(1199)));
    }

    #[test]
    fn rejects_malformed_records() {
        let mut decoder = TransactionDecoder::default();

        assert!(decoder.push(Lsn(1), "not json").is_err());
        assert!(decoder.push(Lsn(1), r#"{"action":"X"}"#).is_err());
    }
}

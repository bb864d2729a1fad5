use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::changelog::inmemory::InMemoryChangeLog;
use crate::outbox::{OutboxRow, OutboxStore};
use crate::transaction::Transactional;

/// An in-memory outbox table for testing or local usage.
///
/// Committed transactions publish their inserts to an [`InMemoryChangeLog`],
/// including rows deleted before the commit, the way a write-ahead log
/// captures them.
#[derive(Clone)]
pub struct InMemoryOutbox {
    log: InMemoryChangeLog,
    schema: String,
    table: String,
    rows: Arc<Mutex<HashMap<Uuid, OutboxRow>>>,
    reject_inserts: Arc<AtomicBool>,
}

/// Open transaction of an [`InMemoryOutbox`].
#[derive(Debug, Default)]
pub struct InMemoryOutboxTransaction {
    inserted: Vec<(OutboxRow, DateTime<Utc>)>,
    deleted: Vec<Uuid>,
}

impl InMemoryOutbox {
    /// Creates an outbox table `schema.table` publishing to `log`.
    pub fn new(log: InMemoryChangeLog, schema: &str, table: &str) -> Self {
        Self {
            log,
            schema: schema.to_owned(),
            table: table.to_owned(),
            rows: Arc::default(),
            reject_inserts: Arc::default(),
        }
    }

    /// Make inserts affect zero rows, like a table the role may not write to.
    pub fn reject_inserts(&self, reject: bool) {
        self.reject_inserts.store(reject, Ordering::SeqCst);
    }

    /// Number of rows currently in the table.
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn columns(row: &OutboxRow, created_at: DateTime<Utc>) -> Map<String, Value> {
    let value = json!({
        "id": row.id.to_string(),
        "aggregate_type": row.aggregate_type,
        "aggregate_id": row.aggregate_id,
        "message_type": row.message_type,
        "payload": row.payload.to_string(),
        "created_at": created_at.to_rfc3339(),
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[async_trait]
impl Transactional for InMemoryOutbox {
    type Transaction = InMemoryOutboxTransaction;

    async fn begin(&self) -> Result<InMemoryOutboxTransaction, tower::BoxError> {
        Ok(InMemoryOutboxTransaction::default())
    }

    async fn commit(&self, tx: InMemoryOutboxTransaction) -> Result<(), tower::BoxError> {
        if tx.inserted.is_empty() {
            return Ok(());
        }
        let captured: Vec<_> = tx
            .inserted
            .iter()
            .map(|(row, created_at)| {
                (
                    self.schema.clone(),
                    self.table.clone(),
                    columns(row, *created_at),
                )
            })
            .collect();
        self.log.commit_inserts(captured).await;

        let mut rows = self.rows.lock().await;
        for (row, _) in tx.inserted {
            if !tx.deleted.contains(&row.id) {
                rows.insert(row.id, row);
            }
        }
        Ok(())
    }

    async fn rollback(&self, _tx: InMemoryOutboxTransaction) -> Result<(), tower::BoxError> {
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    type Transaction<'a> = InMemoryOutboxTransaction;

    async fn insert_message(
        &self,
        row: &OutboxRow,
        tx: &mut <Self as OutboxStore>::Transaction<'_>,
    ) -> Result<Option<DateTime<Utc>>, tower::BoxError> {
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let created_at = Utc::now();
        tx.inserted.push((row.clone(), created_at));
        Ok(Some(created_at))
    }

    async fn delete_message(
        &self,
        id: Uuid,
        tx: &mut <Self as OutboxStore>::Transaction<'_>,
    ) -> Result<(), tower::BoxError> {
        tx.deleted.push(id);
        self.rows.lock().await.remove(&id);
        Ok(())
    }
}

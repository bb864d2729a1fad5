use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::changelog::inmemory::InMemoryChangeLog;
use crate::inbox::{InboxRecord, InboxStore};
use crate::message::InboxMessage;
use crate::transaction::Transactional;

/// An in-memory inbox table for testing or local usage.
///
/// Transactions work on private copies of the rows they touch and apply
/// them on commit. Committed inserts are published to an
/// [`InMemoryChangeLog`]; a committed transaction that only updated rows
/// shows up there as a commit marker.
#[derive(Clone)]
pub struct InMemoryInbox {
    log: InMemoryChangeLog,
    schema: String,
    table: String,
    rows: Arc<Mutex<HashMap<Uuid, InboxMessage>>>,
    reject_inserts: Arc<AtomicBool>,
}

/// Open transaction of an [`InMemoryInbox`].
#[derive(Debug, Default)]
pub struct InMemoryInboxTransaction {
    staged: HashMap<Uuid, InboxMessage>,
    inserted: Vec<Uuid>,
    written: bool,
}

impl InMemoryInbox {
    /// Creates an inbox table `schema.table` publishing to `log`.
    pub fn new(log: InMemoryChangeLog, schema: &str, table: &str) -> Self {
        Self {
            log,
            schema: schema.to_owned(),
            table: table.to_owned(),
            rows: Arc::default(),
            reject_inserts: Arc::default(),
        }
    }

    /// Make inserts affect zero rows.
    pub fn reject_inserts(&self, reject: bool) {
        self.reject_inserts.store(reject, Ordering::SeqCst);
    }

    /// The committed row with the given id.
    pub async fn message(&self, id: Uuid) -> Option<InboxMessage> {
        self.rows.lock().await.get(&id).cloned()
    }

    /// Stage a copy of the committed or staged row for `id`.
    async fn staged<'a>(
        &self,
        id: Uuid,
        tx: &'a mut InMemoryInboxTransaction,
    ) -> Option<&'a mut InboxMessage> {
        if !tx.staged.contains_key(&id) {
            let row = self.rows.lock().await.get(&id).cloned()?;
            tx.staged.insert(id, row);
        }
        tx.staged.get_mut(&id)
    }
}

/// The change-log columns of an inbox insert.
pub(crate) fn columns(message: &InboxMessage) -> Map<String, Value> {
    let value = json!({
        "id": message.id.to_string(),
        "aggregate_type": message.aggregate_type,
        "aggregate_id": message.aggregate_id,
        "message_type": message.message_type,
        "payload": message.payload.to_string(),
        "created_at": message.created_at.to_rfc3339(),
        "processed_at": message.processed_at.map(|ts| ts.to_rfc3339()),
        "retries": message.retries,
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[async_trait]
impl Transactional for InMemoryInbox {
    type Transaction = InMemoryInboxTransaction;

    async fn begin(&self) -> Result<InMemoryInboxTransaction, tower::BoxError> {
        Ok(InMemoryInboxTransaction::default())
    }

    async fn commit(&self, mut tx: InMemoryInboxTransaction) -> Result<(), tower::BoxError> {
        let inserted: Vec<_> = tx
            .inserted
            .iter()
            .filter_map(|id| tx.staged.get(id))
            .map(|msg| (self.schema.clone(), self.table.clone(), columns(msg)))
            .collect();

        let mut rows = self.rows.lock().await;
        rows.extend(tx.staged.drain());
        drop(rows);

        if tx.written {
            self.log.commit_inserts(inserted).await;
        }
        Ok(())
    }

    async fn rollback(&self, _tx: InMemoryInboxTransaction) -> Result<(), tower::BoxError> {
        Ok(())
    }
}

#[async_trait]
impl InboxStore for InMemoryInbox {
    async fn insert_message(
        &self,
        message: &InboxMessage,
        tx: &mut InMemoryInboxTransaction,
    ) -> Result<bool, tower::BoxError> {
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if tx.staged.contains_key(&message.id) || self.rows.lock().await.contains_key(&message.id)
        {
            return Ok(false);
        }
        tx.staged.insert(message.id, message.clone());
        tx.inserted.push(message.id);
        tx.written = true;
        Ok(true)
    }

    async fn find_message(
        &self,
        id: Uuid,
        tx: &mut InMemoryInboxTransaction,
    ) -> Result<Option<InboxRecord>, tower::BoxError> {
        Ok(self.staged(id, tx).await.map(|row| InboxRecord {
            processed_at: row.processed_at,
            retries: row.retries,
        }))
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        tx: &mut InMemoryInboxTransaction,
    ) -> Result<bool, tower::BoxError> {
        let Some(row) = self.staged(id, tx).await else {
            return Ok(false);
        };
        row.processed_at = Some(Utc::now());
        tx.written = true;
        Ok(true)
    }

    async fn increment_retries(
        &self,
        id: Uuid,
        tx: &mut InMemoryInboxTransaction,
    ) -> Result<Option<i16>, tower::BoxError> {
        let Some(row) = self.staged(id, tx).await else {
            return Ok(None);
        };
        row.retries = row.retries.saturating_add(1);
        let retries = row.retries;
        tx.written = true;
        Ok(Some(retries))
    }
}

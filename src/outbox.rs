//! Outbox writer, backend drivers and relay.
//!
//! This module implements the *outbox pattern* on top of the change log:
//! a message row is inserted into the outbox table inside the caller's
//! business transaction and deleted again right away. The change log still
//! records the insert, so the table never grows while the message becomes
//! durable together with the business change.
//!
//! ## Components
//!
//! - [`Outbox`]: writer façade over an outbox backend
//! - [`OutboxStorage`]: writer bound to one aggregate type and message type
//! - [`OutboxStore`]: trait implemented by backends
//! - [`relay`]: the relay that delivers captured messages
//!
//! Concrete backends are provided by [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;
pub mod relay;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::message::{AttemptedMessage, MessageError, OutboxMessage};

/// Row data written to the outbox table.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRow {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub message_type: String,
    pub payload: serde_json::Value,
}

impl From<&OutboxRow> for AttemptedMessage {
    fn from(row: &OutboxRow) -> Self {
        Self {
            id: None,
            aggregate_type: row.aggregate_type.clone(),
            aggregate_id: row.aggregate_id.clone(),
            message_type: row.message_type.clone(),
            payload: row.payload.clone(),
        }
    }
}

/// Trait for writing rows into the outbox table.
///
/// Both operations run on the caller's open transaction.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    /// Transaction type shared with the business write.
    type Transaction<'a>: Send;

    /// Insert the row and return the database-assigned creation time, or
    /// `None` when no row was inserted.
    async fn insert_message(
        &self,
        row: &OutboxRow,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<Option<DateTime<Utc>>, tower::BoxError>;

    /// Delete the row again.
    async fn delete_message(
        &self,
        id: Uuid,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), tower::BoxError>;
}

/// Outbox writer.
///
/// Messages are captured by the change log when the business transaction
/// commits. Nothing is sent immediately.
#[derive(Clone)]
pub struct Outbox<D>(D);

impl<D: OutboxStore> Outbox<D> {
    /// Create a new outbox writer backed by the given backend.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    /// Store a message as part of the caller's transaction.
    ///
    /// The returned message carries the identifier and creation time that
    /// were actually persisted.
    #[instrument(skip(self, payload, tx))]
    pub async fn store(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        message_type: &str,
        payload: &(impl Serialize + Sync + ?Sized),
        tx: &mut D::Transaction<'_>,
    ) -> Result<OutboxMessage, MessageError> {
        let mut row = OutboxRow {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            message_type: message_type.to_owned(),
            payload: serde_json::Value::Null,
        };
        row.payload =
            serde_json::to_value(payload).map_err(|e| MessageError::serde(e, (&row).into()))?;

        let created_at = self
            .0
            .insert_message(&row, tx)
            .await
            .map_err(|e| MessageError::backend(e, (&row).into()))?
            .ok_or_else(|| MessageError::insert_failed((&row).into()))?;

        // The insert is already part of the change log.
        self.0
            .delete_message(row.id, tx)
            .await
            .map_err(|e| MessageError::backend(e, (&row).into()))?;

        Ok(OutboxMessage {
            id: row.id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            message_type: row.message_type,
            payload: row.payload,
            created_at,
        })
    }

    /// Bind the writer to one aggregate type and message type.
    pub fn storage(
        self,
        aggregate_type: impl Into<String>,
        message_type: impl Into<String>,
    ) -> OutboxStorage<D> {
        OutboxStorage {
            outbox: self,
            aggregate_type: aggregate_type.into(),
            message_type: message_type.into(),
        }
    }
}

/// Outbox writer for one kind of message.
#[derive(Clone)]
pub struct OutboxStorage<D> {
    outbox: Outbox<D>,
    aggregate_type: String,
    message_type: String,
}

impl<D: OutboxStore> OutboxStorage<D> {
    /// Store a message of the configured kind as part of the caller's transaction.
    pub async fn store(
        &self,
        aggregate_id: &str,
        payload: &(impl Serialize + Sync + ?Sized),
        tx: &mut D::Transaction<'_>,
    ) -> Result<OutboxMessage, MessageError> {
        self.outbox
            .store(
                aggregate_id,
                &self.aggregate_type,
                &self.message_type,
                payload,
                tx,
            )
            .await
    }
}

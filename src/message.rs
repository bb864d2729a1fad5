//! Message records exchanged through the outbox and inbox tables.
//!
//! Both record types correlate to exactly one business aggregate through the
//! `(aggregate_type, aggregate_id)` pair. Payloads are opaque JSON values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::transaction::TransactionError;

/// A message captured from the outbox table.
///
/// The outbox row only lives between its insert and delete inside the
/// business transaction. Its durable representation is the change-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub message_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// A message persisted in the inbox table.
///
/// The inbox row is the deduplication ledger: `processed_at` is set at most
/// once and `retries` never decreases for a given `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub message_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retries: i16,
}

impl InboxMessage {
    /// Returns `true` when the processed marker is set.
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

/// A received outbox message becomes an unprocessed inbox message.
impl From<OutboxMessage> for InboxMessage {
    fn from(msg: OutboxMessage) -> Self {
        Self {
            id: msg.id,
            aggregate_type: msg.aggregate_type,
            aggregate_id: msg.aggregate_id,
            message_type: msg.message_type,
            payload: msg.payload,
            created_at: msg.created_at,
            processed_at: None,
            retries: 0,
        }
    }
}

/// The message data a writer attempted to store.
///
/// Carried by [`MessageError`] so a failed write never loses the caller's
/// intent. `id` and `created_at` are only known once the row was persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptedMessage {
    pub id: Option<Uuid>,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub message_type: String,
    pub payload: Value,
}

impl From<&InboxMessage> for AttemptedMessage {
    fn from(msg: &InboxMessage) -> Self {
        Self {
            id: Some(msg.id),
            aggregate_type: msg.aggregate_type.clone(),
            aggregate_id: msg.aggregate_id.clone(),
            message_type: msg.message_type.clone(),
            payload: msg.payload.clone(),
        }
    }
}

/// Error returned by the outbox and inbox writers.
#[derive(Debug)]
pub struct MessageError {
    context: SpanTrace,
    kind: MessageErrorKind,
    message: Option<Box<AttemptedMessage>>,
}

/// Machine-readable reason of a [`MessageError`].
#[derive(Debug)]
pub enum MessageErrorKind {
    /// The insert statement affected zero rows.
    InsertFailed,
    /// The storage backend failed.
    Backend(tower::BoxError),
    /// The payload could not be serialized.
    Serde(serde_json::Error),
}

impl MessageError {
    pub(crate) fn insert_failed(message: AttemptedMessage) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: MessageErrorKind::InsertFailed,
            message: Some(Box::new(message)),
        }
    }

    pub(crate) fn backend(err: tower::BoxError, message: AttemptedMessage) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: MessageErrorKind::Backend(err),
            message: Some(Box::new(message)),
        }
    }

    pub(crate) fn serde(err: serde_json::Error, message: AttemptedMessage) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: MessageErrorKind::Serde(err),
            message: Some(Box::new(message)),
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &MessageErrorKind {
        &self.kind
    }

    /// A short stable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self.kind {
            MessageErrorKind::InsertFailed => "INSERT_FAILED",
            MessageErrorKind::Backend(_) => "BACKEND_ERROR",
            MessageErrorKind::Serde(_) => "SERDE_ERROR",
        }
    }

    /// The message the writer tried to store.
    pub fn attempted_message(&self) -> Option<&AttemptedMessage> {
        self.message.as_deref()
    }
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            MessageErrorKind::InsertFailed => match &self.message {
                Some(msg) => writeln!(
                    f,
                    "Could not insert the {} message for aggregate {}",
                    msg.message_type, msg.aggregate_id
                ),
                None => writeln!(f, "Could not insert the message"),
            },
            MessageErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
            MessageErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl From<TransactionError> for MessageError {
    fn from(err: TransactionError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: MessageErrorKind::Backend(err.into_source()),
            message: None,
        }
    }
}

impl std::error::Error for MessageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            MessageErrorKind::InsertFailed => None,
            MessageErrorKind::Backend(err) => Some(err.as_ref()),
            MessageErrorKind::Serde(err) => Some(err),
        }
    }
}

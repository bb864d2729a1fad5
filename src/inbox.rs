//! Inbox writer, verifier/acknowledger, backend drivers and relay.
//!
//! Received messages are first persisted into the inbox table by [`Inbox`].
//! The inbox relay then picks them up from the change log and runs the
//! registered [`InboxMessageHandler`]s inside a transaction that also marks
//! the row processed. The row is the deduplication ledger: it is never
//! deleted, `processed_at` is set at most once and `retries` only grows.
//!
//! ```text
//! received ──verify──▶ processing ──ack──▶ processed
//!    ▲                     │
//!    └──────nack (retry)───┘──nack (budget spent)──▶ retries exceeded
//! ```

pub mod inmemory;
pub mod relay;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use chrono::{DateTime, Utc};
use tracing::instrument;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::message::{AttemptedMessage, InboxMessage, MessageError};
use crate::transaction::{Transactional, TransactionError, execute_transaction};

/// Processing state of a stored inbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboxRecord {
    pub processed_at: Option<DateTime<Utc>>,
    pub retries: i16,
}

/// Trait for reading and updating rows of the inbox table.
///
/// All operations run on an open transaction of the backend.
#[async_trait::async_trait]
pub trait InboxStore: Transactional {
    /// Insert the row unless a row with the same id exists. Returns `true`
    /// when a row was inserted.
    async fn insert_message(
        &self,
        message: &InboxMessage,
        tx: &mut Self::Transaction,
    ) -> Result<bool, tower::BoxError>;

    /// Read the row's processing state, locking it for the transaction.
    async fn find_message(
        &self,
        id: Uuid,
        tx: &mut Self::Transaction,
    ) -> Result<Option<InboxRecord>, tower::BoxError>;

    /// Set `processed_at` to the current time. Returns `false` when no row matched.
    async fn mark_processed(
        &self,
        id: Uuid,
        tx: &mut Self::Transaction,
    ) -> Result<bool, tower::BoxError>;

    /// Increment `retries` and return the new value, or `None` when no row matched.
    async fn increment_retries(
        &self,
        id: Uuid,
        tx: &mut Self::Transaction,
    ) -> Result<Option<i16>, tower::BoxError>;
}

/// Handler of inbox messages of one aggregate type and message type.
///
/// Handlers run in the transaction that marks the message processed, so
/// their writes through `tx` commit together with the processed marker.
#[async_trait::async_trait]
pub trait InboxMessageHandler<T: Send>: Send + Sync {
    fn aggregate_type(&self) -> &str;

    fn message_type(&self) -> &str;

    async fn handle(&self, message: &InboxMessage, tx: &mut T) -> Result<(), tower::BoxError>;
}

/// Inbox writer.
#[derive(Clone)]
pub struct Inbox<D>(D);

impl<D: InboxStore> Inbox<D> {
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    /// Persist a received message in its own transaction.
    ///
    /// The row starts unprocessed with zero retries. Storing a message whose
    /// id is already present leaves the existing row untouched, since the
    /// sender redelivered it.
    #[instrument(skip_all, fields(id = %message.id))]
    pub async fn store(&self, message: InboxMessage) -> Result<(), MessageError> {
        let message = InboxMessage {
            processed_at: None,
            retries: 0,
            ..message
        };
        let store = &self.0;
        execute_transaction(store, |mut tx| async move {
            let result = insert(store, &message, &mut tx).await;
            (tx, result)
        })
        .await
    }
}

async fn insert<D: InboxStore + ?Sized>(
    store: &D,
    message: &InboxMessage,
    tx: &mut D::Transaction,
) -> Result<(), MessageError> {
    let attempted = || AttemptedMessage::from(message);
    let inserted = store
        .insert_message(message, tx)
        .await
        .map_err(|e| MessageError::backend(e, attempted()))?;
    if inserted {
        return Ok(());
    }
    match store.find_message(message.id, tx).await {
        Ok(Some(_)) => {
            tracing::debug!("Inbox message was already stored");
            Ok(())
        }
        Ok(None) => Err(MessageError::insert_failed(attempted())),
        Err(e) => Err(MessageError::backend(e, attempted())),
    }
}

/// Check that `message` may be handled now.
///
/// Fails with [`InboxErrorKind::NotFound`] when the row is missing,
/// [`InboxErrorKind::AlreadyProcessed`] when it was handled before and
/// [`InboxErrorKind::RetriesExceeded`] when its retry budget is spent.
pub async fn verify<D: InboxStore + ?Sized>(
    store: &D,
    message: &InboxMessage,
    tx: &mut D::Transaction,
    max_retries: i16,
) -> Result<(), InboxError> {
    let record = store
        .find_message(message.id, tx)
        .await
        .map_err(|e| InboxError::backend(e, message.id))?
        .ok_or_else(|| InboxError::new(InboxErrorKind::NotFound, message.id))?;
    if record.processed_at.is_some() {
        return Err(InboxError::new(InboxErrorKind::AlreadyProcessed, message.id));
    }
    if record.retries > max_retries {
        return Err(InboxError::new(
            InboxErrorKind::RetriesExceeded {
                retries: record.retries,
            },
            message.id,
        ));
    }
    Ok(())
}

/// Mark `message` processed.
pub async fn ack<D: InboxStore + ?Sized>(
    store: &D,
    message: &InboxMessage,
    tx: &mut D::Transaction,
) -> Result<(), InboxError> {
    let updated = store
        .mark_processed(message.id, tx)
        .await
        .map_err(|e| InboxError::backend(e, message.id))?;
    if !updated {
        return Err(InboxError::new(InboxErrorKind::NotFound, message.id));
    }
    Ok(())
}

/// Outcome of a [`nack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The message will be handled again on redelivery.
    Retry,
    /// The retry budget is spent. The message will not be handled again.
    RetriesExceeded,
}

/// Count a failed attempt of `message`.
pub async fn nack<D: InboxStore + ?Sized>(
    store: &D,
    message: &InboxMessage,
    tx: &mut D::Transaction,
    max_retries: i16,
) -> Result<NackOutcome, InboxError> {
    let retries = store
        .increment_retries(message.id, tx)
        .await
        .map_err(|e| InboxError::backend(e, message.id))?
        .ok_or_else(|| InboxError::new(InboxErrorKind::NotFound, message.id))?;
    if retries > max_retries {
        Ok(NackOutcome::RetriesExceeded)
    } else {
        Ok(NackOutcome::Retry)
    }
}

/// Error raised while verifying, handling or acknowledging an inbox message.
#[derive(Debug)]
pub struct InboxError {
    context: SpanTrace,
    kind: InboxErrorKind,
    message_id: Option<Uuid>,
}

#[derive(Debug)]
pub enum InboxErrorKind {
    /// The message was processed before.
    AlreadyProcessed,
    /// No inbox row exists for the message.
    NotFound,
    /// The retry budget of the message is spent.
    RetriesExceeded { retries: i16 },
    /// A registered handler failed.
    Handler(tower::BoxError),
    /// The storage backend failed.
    Backend(tower::BoxError),
}

impl InboxError {
    fn new(kind: InboxErrorKind, message_id: Uuid) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
            message_id: Some(message_id),
        }
    }

    pub(crate) fn handler(err: tower::BoxError, message_id: Uuid) -> Self {
        Self::new(InboxErrorKind::Handler(err), message_id)
    }

    pub(crate) fn backend(err: tower::BoxError, message_id: Uuid) -> Self {
        Self::new(InboxErrorKind::Backend(err), message_id)
    }

    pub fn kind(&self) -> &InboxErrorKind {
        &self.kind
    }

    pub fn message_id(&self) -> Option<Uuid> {
        self.message_id
    }

    /// A short stable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self.kind {
            InboxErrorKind::AlreadyProcessed => "ALREADY_PROCESSED",
            InboxErrorKind::NotFound => "INBOX_MESSAGE_NOT_FOUND",
            InboxErrorKind::RetriesExceeded { .. } => "RETRIES_EXCEEDED",
            InboxErrorKind::Handler(_) => "HANDLER_ERROR",
            InboxErrorKind::Backend(_) => "BACKEND_ERROR",
        }
    }

    /// Returns `true` when handling the message again cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.kind,
            InboxErrorKind::AlreadyProcessed
                | InboxErrorKind::NotFound
                | InboxErrorKind::RetriesExceeded { .. }
        )
    }
}

impl std::fmt::Display for InboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id = self
            .message_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        match &self.kind {
            InboxErrorKind::AlreadyProcessed => {
                writeln!(f, "Inbox message {id} was already processed")
            }
            InboxErrorKind::NotFound => writeln!(f, "Inbox message {id} was not found"),
            InboxErrorKind::RetriesExceeded { retries } => {
                writeln!(f, "Inbox message {id} exceeded its retries ({retries})")
            }
            InboxErrorKind::Handler(err) => {
                writeln!(f, "Handler of inbox message {id} failed: {err}")
            }
            InboxErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for InboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            InboxErrorKind::Handler(err) | InboxErrorKind::Backend(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<TransactionError> for InboxError {
    fn from(err: TransactionError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: InboxErrorKind::Backend(err.into_source()),
            message_id: None,
        }
    }
}

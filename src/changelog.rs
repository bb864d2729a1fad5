//! Decoded change-log events and change-log backends.
//!
//! A change log is the ordered feed of committed row changes that the
//! database exposes through a replication slot. This crate does not speak the
//! streaming protocol itself: backends hand over already-decoded row events
//! and advance the slot's durable position on acknowledgment.
//!
//! ## Components
//!
//! - [`ChangeEvent`]: one decoded row change with its log position
//! - [`Lsn`]: a log sequence number
//! - [`ChangeLog`]: trait for subscribing to and acknowledging a slot
//!
//! Concrete backends are [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::{InboxMessage, OutboxMessage};

/// A PostgreSQL log sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = ChangeLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChangeLogError::decode(format!("invalid log sequence number '{s}'"));
        let (high, low) = s.split_once('/').ok_or_else(invalid)?;
        let high = u64::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u64::from_str_radix(low, 16).map_err(|_| invalid())?;
        if high > u32::MAX as u64 || low > u32::MAX as u64 {
            return Err(invalid());
        }
        Ok(Lsn((high << 32) | low))
    }
}

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Truncate,
    /// End of a transaction without row changes of its own. Carries only a
    /// position, so the log can advance past unrelated transactions.
    Commit,
}

/// A decoded row-level change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Position to acknowledge once the event has been handled.
    pub lsn: Lsn,
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    /// New column values keyed by column name.
    pub columns: Map<String, Value>,
}

impl ChangeEvent {
    /// A position-only event for a committed transaction.
    pub fn commit(lsn: Lsn) -> Self {
        Self {
            lsn,
            kind: ChangeKind::Commit,
            schema: String::new(),
            table: String::new(),
            columns: Map::new(),
        }
    }

    /// Whether this event is an insert into `schema.table`.
    pub fn is_insert_into(&self, schema: &str, table: &str) -> bool {
        self.kind == ChangeKind::Insert && self.schema == schema && self.table == table
    }
}

/// Trait for consuming a replication slot.
///
/// `subscribe` yields the events after the slot's confirmed position in commit
/// order. A stream that ends without error is a clean end of the subscription;
/// the caller resubscribes to continue. Events that were not acknowledged are
/// delivered again by the next subscription.
#[async_trait::async_trait]
pub trait ChangeLog: Send + Sync {
    /// Start a subscription, ending early when `cancel` fires.
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<ChangeEvent, ChangeLogError>>, ChangeLogError>;

    /// Advance the slot's durable position to `lsn`.
    async fn acknowledge(&self, lsn: Lsn) -> Result<(), ChangeLogError>;
}

#[async_trait::async_trait]
impl<T: ChangeLog + ?Sized> ChangeLog for std::sync::Arc<T> {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<ChangeEvent, ChangeLogError>>, ChangeLogError> {
        (**self).subscribe(cancel).await
    }

    async fn acknowledge(&self, lsn: Lsn) -> Result<(), ChangeLogError> {
        (**self).acknowledge(lsn).await
    }
}

/// Subscription-level failure: connection loss, decoding failure, revoked permission.
#[derive(Debug)]
pub struct ChangeLogError {
    context: SpanTrace,
    kind: ChangeLogErrorKind,
}

/// Kinds of change-log errors.
#[derive(Debug)]
pub enum ChangeLogErrorKind {
    /// The subscription could not be established or was lost.
    Subscription(tower::BoxError),
    /// A change event could not be decoded.
    Decode(String),
}

impl ChangeLogError {
    pub fn subscription(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ChangeLogErrorKind::Subscription(err.into()),
        }
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ChangeLogErrorKind::Decode(reason.into()),
        }
    }

    pub fn kind(&self) -> &ChangeLogErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ChangeLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ChangeLogErrorKind::Subscription(err) => writeln!(f, "Subscription error: {err}"),
            ChangeLogErrorKind::Decode(reason) => writeln!(f, "Decode error: {reason}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ChangeLogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ChangeLogErrorKind::Subscription(err) => Some(err.as_ref()),
            ChangeLogErrorKind::Decode(_) => None,
        }
    }
}

/// Maps the columns of an outbox insert to a message.
pub fn decode_outbox_message(event: &ChangeEvent) -> Result<OutboxMessage, ChangeLogError> {
    let columns = &event.columns;
    Ok(OutboxMessage {
        id: uuid_column(columns, "id")?,
        aggregate_type: text_column(columns, "aggregate_type")?,
        aggregate_id: text_column(columns, "aggregate_id")?,
        message_type: text_column(columns, "message_type")?,
        payload: json_column(columns, "payload")?,
        created_at: timestamp_column(columns, "created_at")?,
    })
}

/// Maps the columns of an inbox insert to a message.
pub fn decode_inbox_message(event: &ChangeEvent) -> Result<InboxMessage, ChangeLogError> {
    let columns = &event.columns;
    let processed_at = match columns.get("processed_at") {
        None | Some(Value::Null) => None,
        Some(_) => Some(timestamp_column(columns, "processed_at")?),
    };
    let retries = match columns.get("retries") {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|n| i16::try_from(n).ok())
            .ok_or_else(|| ChangeLogError::decode(format!("column retries out of range: {n}")))?,
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| ChangeLogError::decode(format!("column retries is not a number: {s}")))?,
        Some(other) => {
            return Err(ChangeLogError::decode(format!(
                "column retries has unexpected value {other}"
            )));
        }
    };
    Ok(InboxMessage {
        id: uuid_column(columns, "id")?,
        aggregate_type: text_column(columns, "aggregate_type")?,
        aggregate_id: text_column(columns, "aggregate_id")?,
        message_type: text_column(columns, "message_type")?,
        payload: json_column(columns, "payload")?,
        created_at: timestamp_column(columns, "created_at")?,
        processed_at,
        retries,
    })
}

fn column<'a>(columns: &'a Map<String, Value>, name: &str) -> Result<&'a Value, ChangeLogError> {
    columns
        .get(name)
        .ok_or_else(|| ChangeLogError::decode(format!("missing column {name}")))
}

fn text_column(columns: &Map<String, Value>, name: &str) -> Result<String, ChangeLogError> {
    match column(columns, name)? {
        Value::String(s) => Ok(s.clone()),
        other => Err(ChangeLogError::decode(format!(
            "column {name} is not text: {other}"
        ))),
    }
}

fn uuid_column(columns: &Map<String, Value>, name: &str) -> Result<Uuid, ChangeLogError> {
    let text = text_column(columns, name)?;
    Uuid::parse_str(&text)
        .map_err(|e| ChangeLogError::decode(format!("column {name} is not a uuid: {e}")))
}

/// JSON columns may arrive either inline or as their text representation.
fn json_column(columns: &Map<String, Value>, name: &str) -> Result<Value, ChangeLogError> {
    match column(columns, name)? {
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| ChangeLogError::decode(format!("column {name} is not json: {e}"))),
        other => Ok(other.clone()),
    }
}

fn timestamp_column(
    columns: &Map<String, Value>,
    name: &str,
) -> Result<DateTime<Utc>, ChangeLogError> {
    let text = text_column(columns, name)?;
    parse_timestamp(&text)
        .ok_or_else(|| ChangeLogError::decode(format!("column {name} is not a timestamp: {text}")))
}

/// Parses RFC 3339 as well as the PostgreSQL `timestamptz` text output.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

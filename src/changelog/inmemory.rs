use async_stream::stream;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::changelog::{ChangeEvent, ChangeKind, ChangeLog, ChangeLogError, Lsn};

/// An in-memory change log for testing or local usage.
///
/// Keeps every appended event together with a confirmed position, like a
/// replication slot. Each subscription replays the events after the confirmed
/// position and then ends. The log can be switched unavailable to simulate a
/// database outage.
#[derive(Clone, Default)]
pub struct InMemoryChangeLog {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    events: Vec<ChangeEvent>,
    last_lsn: Lsn,
    confirmed: Lsn,
    unavailable: bool,
    subscriptions: usize,
}

impl InMemoryChangeLog {
    /// Record the inserts of one committed transaction.
    ///
    /// All rows share the transaction's log position. A transaction without
    /// inserts still takes a position and is recorded as a commit marker.
    pub async fn commit_inserts(
        &self,
        rows: impl IntoIterator<Item = (String, String, Map<String, Value>)>,
    ) -> Lsn {
        let mut state = self.state.lock().await;
        state.last_lsn = Lsn(state.last_lsn.0 + 1);
        let lsn = state.last_lsn;
        let before = state.events.len();
        for (schema, table, columns) in rows {
            state.events.push(ChangeEvent {
                lsn,
                kind: ChangeKind::Insert,
                schema,
                table,
                columns,
            });
        }
        if state.events.len() == before {
            state.events.push(ChangeEvent::commit(lsn));
        }
        lsn
    }

    /// Record a single change in its own transaction.
    pub async fn append(
        &self,
        kind: ChangeKind,
        schema: &str,
        table: &str,
        columns: Map<String, Value>,
    ) -> Lsn {
        let mut state = self.state.lock().await;
        state.last_lsn = Lsn(state.last_lsn.0 + 1);
        let lsn = state.last_lsn;
        state.events.push(ChangeEvent {
            lsn,
            kind,
            schema: schema.to_owned(),
            table: table.to_owned(),
            columns,
        });
        lsn
    }

    /// Make subscriptions and acknowledgments fail until switched back.
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.unavailable = !available;
    }

    /// The durable replay position.
    pub async fn confirmed(&self) -> Lsn {
        self.state.lock().await.confirmed
    }

    /// Number of events after the confirmed position.
    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state
            .events
            .iter()
            .filter(|e| e.lsn > state.confirmed)
            .count()
    }

    /// Number of subscriptions started so far, including failed ones.
    pub async fn subscriptions(&self) -> usize {
        self.state.lock().await.subscriptions
    }
}

#[async_trait]
impl ChangeLog for InMemoryChangeLog {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<ChangeEvent, ChangeLogError>>, ChangeLogError> {
        let mut state = self.state.lock().await;
        state.subscriptions += 1;
        if state.unavailable {
            return Err(ChangeLogError::subscription("change log is unavailable"));
        }
        let events: Vec<_> = state
            .events
            .iter()
            .filter(|e| e.lsn > state.confirmed)
            .cloned()
            .collect();
        drop(state);

        Ok(Box::pin(stream! {
            for event in events {
                if cancel.is_cancelled() {
                    break;
                }
                yield Ok(event);
            }
        }))
    }

    async fn acknowledge(&self, lsn: Lsn) -> Result<(), ChangeLogError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(ChangeLogError::subscription("change log is unavailable"));
        }
        // A slot never moves backwards.
        state.confirmed = state.confirmed.max(lsn);
        Ok(())
    }
}

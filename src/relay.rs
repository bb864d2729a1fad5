//! Generic change-log relay shared by the outbox and inbox relays.
//!
//! A relay subscribes to a [`ChangeLog`], picks the insert events of one
//! table, decodes them into messages and hands each message to a
//! [`MessageHandler`]. The log position of a message is only acknowledged
//! after the handler succeeded or an [`ErrorResolver`] decided the message
//! must not be retried.
//!
//! Events are handled one at a time in commit order. The next event is not
//! pulled before the current handler settles.
//!
//! Subscriptions are kept alive by the [`supervisor`], which restarts them
//! after clean ends and errors until the relay is stopped.

pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::changelog::{ChangeEvent, ChangeLog, ChangeLogError, Lsn};
use crate::{InboxMessage, OutboxMessage};

pub use supervisor::{RelayHandle, Supervisor, SupervisorEvent, SupervisorState};

/// Identity of a relayed message, as seen by hooks.
pub trait RelayMessage: Send + Sync {
    fn id(&self) -> Uuid;
    fn aggregate_type(&self) -> &str;
    fn aggregate_id(&self) -> &str;
    fn message_type(&self) -> &str;
}

impl RelayMessage for OutboxMessage {
    fn id(&self) -> Uuid {
        self.id
    }

    fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    fn message_type(&self) -> &str {
        &self.message_type
    }
}

impl RelayMessage for InboxMessage {
    fn id(&self) -> Uuid {
        self.id
    }

    fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    fn message_type(&self) -> &str {
        &self.message_type
    }
}

/// Handles one decoded message.
#[async_trait::async_trait]
pub trait MessageHandler<M>: Send + Sync {
    async fn handle(&self, message: &M) -> Result<(), tower::BoxError>;
}

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Leave the log position unacknowledged so the message is delivered again.
    Retry,
    /// Retrying cannot change the outcome; acknowledge as handled.
    Resolved,
    /// Give up on the message and acknowledge it. Needs external attention.
    Abandoned,
}

/// Decides between retrying and abandoning a failed message.
#[async_trait::async_trait]
pub trait ErrorResolver<M>: Send + Sync {
    async fn resolve(
        &self,
        error: &(dyn std::error::Error + Send + Sync + 'static),
        message: &M,
    ) -> Resolution;
}

/// Resolver that always retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

#[async_trait::async_trait]
impl<M: Sync> ErrorResolver<M> for AlwaysRetry {
    async fn resolve(
        &self,
        _error: &(dyn std::error::Error + Send + Sync + 'static),
        _message: &M,
    ) -> Resolution {
        Resolution::Retry
    }
}

/// Hook trait for observing relay lifecycle events.
///
/// This is the logging capability of a relay. Hooks are invoked
/// synchronously and should avoid heavy or blocking work.
pub trait RelayHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_subscription_started(&self);
    fn on_subscription_ended(&self);
    fn on_subscription_error(&self, error: &dyn std::error::Error);
    fn on_restart_scheduled(&self, delay: Duration);
    fn on_message_received(&self, message: &dyn RelayMessage);
    fn on_message_handled(&self, message: &dyn RelayMessage);
    fn on_message_failed(
        &self,
        message: &dyn RelayMessage,
        error: &dyn std::error::Error,
        resolution: Resolution,
    );
    fn on_acknowledged(&self, lsn: Lsn);
}

/// Default relay hook implementation.
///
/// Logs lifecycle events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRelayHook;

impl RelayHook for DefaultRelayHook {
    fn on_startup(&self) {
        tracing::info!("Relay is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Relay is shutting down");
    }

    fn on_subscription_started(&self) {
        tracing::debug!("Subscribed to the change log");
    }

    fn on_subscription_ended(&self) {
        tracing::trace!("Change log subscription ended");
    }

    fn on_subscription_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Change log subscription failed");
    }

    fn on_restart_scheduled(&self, delay: Duration) {
        tracing::trace!(?delay, "Resubscribing to the change log");
    }

    fn on_message_received(&self, message: &dyn RelayMessage) {
        tracing::trace!(
            id = %message.id(),
            aggregate_type = message.aggregate_type(),
            message_type = message.message_type(),
            "Received a change log message"
        );
    }

    fn on_message_handled(&self, message: &dyn RelayMessage) {
        tracing::debug!(id = %message.id(), "Message handled");
    }

    fn on_message_failed(
        &self,
        message: &dyn RelayMessage,
        error: &dyn std::error::Error,
        resolution: Resolution,
    ) {
        let id = message.id();
        match resolution {
            Resolution::Retry => {
                tracing::error!(%id, %error, "Could not handle the message, it will be retried")
            }
            Resolution::Resolved => {
                tracing::warn!(
                    %id,
                    aggregate_id = message.aggregate_id(),
                    %error,
                    "Received message cannot be processed and is skipped"
                )
            }
            Resolution::Abandoned => tracing::error!(
                %id,
                aggregate_type = message.aggregate_type(),
                message_type = message.message_type(),
                %error,
                "Message exceeded its retry budget and is abandoned"
            ),
        }
    }

    fn on_acknowledged(&self, lsn: Lsn) {
        tracing::trace!(%lsn, "Acknowledged log position");
    }
}

/// Hook that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentHook;

impl RelayHook for SilentHook {
    fn on_startup(&self) {}
    fn on_shutdown(&self) {}
    fn on_subscription_started(&self) {}
    fn on_subscription_ended(&self) {}
    fn on_subscription_error(&self, _error: &dyn std::error::Error) {}
    fn on_restart_scheduled(&self, _delay: Duration) {}
    fn on_message_received(&self, _message: &dyn RelayMessage) {}
    fn on_message_handled(&self, _message: &dyn RelayMessage) {}
    fn on_message_failed(
        &self,
        _message: &dyn RelayMessage,
        _error: &dyn std::error::Error,
        _resolution: Resolution,
    ) {
    }
    fn on_acknowledged(&self, _lsn: Lsn) {}
}

/// Tracks which log position may be acknowledged.
///
/// Rows written by one transaction share a position, so a position is only
/// released once a later position shows up or the subscription ended, and
/// only if every event at it was handled. After a failure nothing is
/// released anymore during this subscription.
#[derive(Debug, Default)]
pub(crate) struct AckCursor {
    completed: Option<Lsn>,
    blocked: bool,
}

impl AckCursor {
    /// Called before handling an event at `lsn`. Returns a position to acknowledge.
    pub(crate) fn begin(&mut self, lsn: Lsn) -> Option<Lsn> {
        match self.completed {
            Some(done) if lsn > done && !self.blocked => self.completed.take(),
            _ => None,
        }
    }

    pub(crate) fn complete(&mut self, lsn: Lsn) {
        if !self.blocked {
            self.completed = Some(lsn);
        }
    }

    pub(crate) fn fail(&mut self) {
        self.blocked = true;
        self.completed = None;
    }

    /// Position to acknowledge after the subscription ended cleanly.
    pub(crate) fn finish(self) -> Option<Lsn> {
        if self.blocked { None } else { self.completed }
    }
}

/// Result of one subscription cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The subscription ended on its own.
    Ended { handled: usize },
    /// The relay was stopped during the subscription.
    Cancelled,
}

/// A relay subscription that can be run repeatedly by the supervisor.
#[async_trait::async_trait]
pub trait Subscription: Send + Sync + 'static {
    /// Subscribe once and process events until the subscription ends.
    async fn run_cycle(&self, cancel: CancellationToken) -> Result<CycleOutcome, ChangeLogError>;

    fn hook(&self) -> &dyn RelayHook;
}

type Decoder<M> = fn(&ChangeEvent) -> Result<M, ChangeLogError>;

/// Relay of the inserts of one table to a message handler.
pub struct Relay<L, M, H, R> {
    changelog: L,
    schema: String,
    table: String,
    decode: Decoder<M>,
    handler: H,
    resolver: R,
    hook: Arc<dyn RelayHook>,
}

impl<L, M, H, R> Relay<L, M, H, R>
where
    L: ChangeLog + 'static,
    M: RelayMessage + 'static,
    H: MessageHandler<M> + 'static,
    R: ErrorResolver<M> + 'static,
{
    pub fn new(
        changelog: L,
        schema: impl Into<String>,
        table: impl Into<String>,
        decode: Decoder<M>,
        handler: H,
        resolver: R,
    ) -> Self {
        Self {
            changelog,
            schema: schema.into(),
            table: table.into(),
            decode,
            handler,
            resolver,
            hook: Arc::new(DefaultRelayHook),
        }
    }

    /// Replace the hook used for logging.
    pub fn with_hook(mut self, hook: Arc<dyn RelayHook>) -> Self {
        self.hook = hook;
        self
    }

    async fn acknowledge(&self, lsn: Lsn) -> Result<(), ChangeLogError> {
        self.changelog.acknowledge(lsn).await?;
        self.hook.on_acknowledged(lsn);
        Ok(())
    }

    /// Handle one message. Returns `true` when its position may be acknowledged.
    async fn deliver(&self, message: &M) -> bool {
        self.hook.on_message_received(message);
        match self.handler.handle(message).await {
            Ok(()) => {
                self.hook.on_message_handled(message);
                true
            }
            Err(err) => {
                let resolution = self.resolver.resolve(err.as_ref(), message).await;
                self.hook
                    .on_message_failed(message, err.as_ref(), resolution);
                resolution != Resolution::Retry
            }
        }
    }
}

#[async_trait::async_trait]
impl<L, M, H, R> Subscription for Relay<L, M, H, R>
where
    L: ChangeLog + 'static,
    M: RelayMessage + 'static,
    H: MessageHandler<M> + 'static,
    R: ErrorResolver<M> + 'static,
{
    #[tracing::instrument(skip_all, fields(table = %self.table))]
    async fn run_cycle(&self, cancel: CancellationToken) -> Result<CycleOutcome, ChangeLogError> {
        let mut events = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
            events = self.changelog.subscribe(cancel.clone()) => events?,
        };
        self.hook.on_subscription_started();

        let mut cursor = AckCursor::default();
        let mut handled = 0;
        loop {
            // A stopped relay must not pull another event, even a ready one.
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
                event = events.next() => event,
            };
            let event = match event {
                Some(event) => event?,
                None => break,
            };
            if let Some(lsn) = cursor.begin(event.lsn) {
                self.acknowledge(lsn).await?;
            }
            if !event.is_insert_into(&self.schema, &self.table) {
                cursor.complete(event.lsn);
                continue;
            }

            let message = (self.decode)(&event)?;
            if self.deliver(&message).await {
                cursor.complete(event.lsn);
            } else {
                cursor.fail();
            }
            handled += 1;
        }

        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }
        if let Some(lsn) = cursor.finish() {
            self.acknowledge(lsn).await?;
        }
        self.hook.on_subscription_ended();
        Ok(CycleOutcome::Ended { handled })
    }

    fn hook(&self) -> &dyn RelayHook {
        self.hook.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::decode_outbox_message;
    use crate::changelog::inmemory::InMemoryChangeLog;
    use crate::changelog::ChangeKind;
    use futures_core::stream::BoxStream;
    use serde_json::{Map, Value, json};
    use std::sync::Mutex;

    fn row(n: i32) -> Map<String, Value> {
        json!({
            "id": Uuid::new_v4().to_string(),
            "aggregate_type": "movie",
            "aggregate_id": n.to_string(),
            "message_type": "movie_created",
            "payload": { "n": n },
            "created_at": "2023-01-18T21:02:27Z",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    /// Fails for the aggregate ids it was told to fail.
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
        failing: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl MessageHandler<OutboxMessage> for Arc<Recording> {
        async fn handle(&self, message: &OutboxMessage) -> Result<(), tower::BoxError> {
            self.seen.lock().unwrap().push(message.aggregate_id.clone());
            if self.failing.lock().unwrap().contains(&message.aggregate_id) {
                return Err("bus unavailable".into());
            }
            Ok(())
        }
    }

    struct AlwaysAbandon;

    #[async_trait::async_trait]
    impl ErrorResolver<OutboxMessage> for AlwaysAbandon {
        async fn resolve(
            &self,
            _error: &(dyn std::error::Error + Send + Sync + 'static),
            _message: &OutboxMessage,
        ) -> Resolution {
            Resolution::Abandoned
        }
    }

    fn relay<R: ErrorResolver<OutboxMessage> + 'static>(
        log: &InMemoryChangeLog,
        handler: &Arc<Recording>,
        resolver: R,
    ) -> Relay<InMemoryChangeLog, OutboxMessage, Arc<Recording>, R> {
        Relay::new(
            log.clone(),
            "messaging",
            "outbox",
            decode_outbox_message,
            handler.clone(),
            resolver,
        )
        .with_hook(Arc::new(SilentHook))
    }

    #[test]
    fn cursor_releases_a_position_once_it_is_complete() {
        let mut cursor = AckCursor::default();

        assert_eq!(cursor.begin(Lsn(1)), None);
        cursor.complete(Lsn(1));
        assert_eq!(cursor.begin(Lsn(1)), None);
        cursor.complete(Lsn(1));
        assert_eq!(cursor.begin(Lsn(2)), Some(Lsn(1)));
        cursor.complete(Lsn(2));
        assert_eq!(cursor.finish(), Some(Lsn(2)));
    }

    #[test]
    fn cursor_never_passes_a_failed_position() {
        let mut cursor = AckCursor::default();

        cursor.begin(Lsn(1));
        cursor.complete(Lsn(1));
        assert_eq!(cursor.begin(Lsn(2)), Some(Lsn(1)));
        cursor.fail();
        assert_eq!(cursor.begin(Lsn(3)), None);
        cursor.complete(Lsn(3));
        assert_eq!(cursor.begin(Lsn(4)), None);
        assert_eq!(cursor.finish(), None);
    }

    #[tokio::test]
    async fn delivers_table_inserts_and_acknowledges_them() {
        let log = InMemoryChangeLog::default();
        log.append(ChangeKind::Insert, "messaging", "outbox", row(1))
            .await;
        log.append(ChangeKind::Insert, "public", "outbox", row(2))
            .await;
        log.append(ChangeKind::Delete, "messaging", "outbox", row(3))
            .await;
        let last = log
            .append(ChangeKind::Insert, "messaging", "outbox", row(4))
            .await;
        let handler = Arc::new(Recording::default());

        let outcome = relay(&log, &handler, AlwaysRetry)
            .run_cycle(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, CycleOutcome::Ended { handled: 2 });
        assert_eq!(*handler.seen.lock().unwrap(), ["1", "4"]);
        assert_eq!(log.confirmed().await, last);
    }

    #[tokio::test]
    async fn failed_delivery_is_redelivered_with_its_successors() {
        let log = InMemoryChangeLog::default();
        let first = log
            .append(ChangeKind::Insert, "messaging", "outbox", row(1))
            .await;
        log.append(ChangeKind::Insert, "messaging", "outbox", row(2))
            .await;
        log.append(ChangeKind::Insert, "messaging", "outbox", row(3))
            .await;
        let handler = Arc::new(Recording::default());
        handler.failing.lock().unwrap().push("2".into());
        let relay = relay(&log, &handler, AlwaysRetry);

        relay.run_cycle(CancellationToken::new()).await.unwrap();
        assert_eq!(*handler.seen.lock().unwrap(), ["1", "2", "3"]);
        assert_eq!(log.confirmed().await, first);

        handler.failing.lock().unwrap().clear();
        relay.run_cycle(CancellationToken::new()).await.unwrap();
        assert_eq!(*handler.seen.lock().unwrap(), ["1", "2", "3", "2", "3"]);
        assert_eq!(log.pending().await, 0);
    }

    #[tokio::test]
    async fn abandoned_messages_are_acknowledged() {
        let log = InMemoryChangeLog::default();
        log.append(ChangeKind::Insert, "messaging", "outbox", row(1))
            .await;
        let handler = Arc::new(Recording::default());
        handler.failing.lock().unwrap().push("1".into());

        relay(&log, &handler, AlwaysAbandon)
            .run_cycle(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(log.pending().await, 0);
    }

    #[tokio::test]
    async fn default_hook_logs_through_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("walbox=trace")
            .with_test_writer()
            .try_init();
        let log = InMemoryChangeLog::default();
        log.append(ChangeKind::Insert, "messaging", "outbox", row(1))
            .await;
        log.append(ChangeKind::Insert, "messaging", "outbox", row(2))
            .await;
        let handler = Arc::new(Recording::default());
        handler.failing.lock().unwrap().push("2".into());

        let outcome = Relay::new(
            log.clone(),
            "messaging",
            "outbox",
            decode_outbox_message,
            handler.clone(),
            AlwaysAbandon,
        )
        .run_cycle(CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(outcome, CycleOutcome::Ended { handled: 2 });
        assert_eq!(log.pending().await, 0);
    }

    #[tokio::test]
    async fn undecodable_events_fail_the_subscription() {
        let log = InMemoryChangeLog::default();
        log.append(
            ChangeKind::Insert,
            "messaging",
            "outbox",
            json!({ "id": "nope" }).as_object().cloned().unwrap(),
        )
        .await;
        let handler = Arc::new(Recording::default());

        let result = relay(&log, &handler, AlwaysRetry)
            .run_cycle(CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert_eq!(log.pending().await, 1);
    }

    #[tokio::test]
    async fn empty_transactions_advance_the_position() {
        let log = InMemoryChangeLog::default();
        log.append(ChangeKind::Insert, "messaging", "outbox", row(1))
            .await;
        let mut last = Lsn(0);
        for _ in 0..5 {
            last = log.commit_inserts(Vec::new()).await;
        }
        let handler = Arc::new(Recording::default());

        let outcome = relay(&log, &handler, AlwaysRetry)
            .run_cycle(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, CycleOutcome::Ended { handled: 1 });
        assert_eq!(log.confirmed().await, last);
        assert_eq!(log.pending().await, 0);
    }

    /// A log whose streams keep yielding regardless of cancellation.
    struct EagerLog(Vec<ChangeEvent>);

    #[async_trait::async_trait]
    impl ChangeLog for EagerLog {
        async fn subscribe(
            &self,
            _cancel: CancellationToken,
        ) -> Result<BoxStream<'_, Result<ChangeEvent, ChangeLogError>>, ChangeLogError> {
            Ok(Box::pin(tokio_stream::iter(
                self.0.clone().into_iter().map(Ok),
            )))
        }

        async fn acknowledge(&self, _lsn: Lsn) -> Result<(), ChangeLogError> {
            Ok(())
        }
    }

    /// Stops the relay from inside the first handled message.
    struct StopOnFirst {
        cancel: CancellationToken,
        seen: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl MessageHandler<OutboxMessage> for Arc<StopOnFirst> {
        async fn handle(&self, _message: &OutboxMessage) -> Result<(), tower::BoxError> {
            *self.seen.lock().unwrap() += 1;
            self.cancel.cancel();
            Ok(())
        }
    }

    #[tokio::test]
    async fn stopping_during_a_message_pulls_no_further_events() {
        let events = (1..=20)
            .map(|n| ChangeEvent {
                lsn: Lsn(n as u64),
                kind: ChangeKind::Insert,
                schema: "messaging".into(),
                table: "outbox".into(),
                columns: row(n),
            })
            .collect();
        let cancel = CancellationToken::new();
        let handler = Arc::new(StopOnFirst {
            cancel: cancel.clone(),
            seen: Mutex::new(0),
        });

        let outcome = Relay::new(
            EagerLog(events),
            "messaging",
            "outbox",
            decode_outbox_message,
            handler.clone(),
            AlwaysRetry,
        )
        .with_hook(Arc::new(SilentHook))
        .run_cycle(cancel)
        .await
        .unwrap();

        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert_eq!(*handler.seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_cycle_acknowledges_nothing_pending() {
        let log = InMemoryChangeLog::default();
        log.append(ChangeKind::Insert, "messaging", "outbox", row(1))
            .await;
        let handler = Arc::new(Recording::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = relay(&log, &handler, AlwaysRetry)
            .run_cycle(cancel)
            .await
            .unwrap();

        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert_eq!(log.pending().await, 1);
    }
}

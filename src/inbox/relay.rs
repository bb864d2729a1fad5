//! Relay of stored inbox messages to their handlers.
//!
//! For every inbox insert the relay opens a transaction, verifies the row,
//! runs the matching handlers and marks the row processed. Failures roll
//! the transaction back and are counted on the row in a transaction of
//! their own. The log position is acknowledged unless the message is to be
//! retried, so the inbox table and not the change log decides whether a
//! message still needs handling.

use std::sync::Arc;

use crate::changelog::{ChangeLog, decode_inbox_message};
use crate::config::{DEFAULT_MAX_RETRIES, MAX_RETRIES_LIMIT, ReconnectPolicy};
use crate::inbox::{InboxError, InboxMessageHandler, InboxStore, NackOutcome, ack, nack, verify};
use crate::relay::{
    DefaultRelayHook, ErrorResolver, MessageHandler, Relay, RelayHandle, RelayHook, Resolution,
};
use crate::transaction::execute_transaction;
use crate::InboxMessage;

type Handlers<T> = Vec<Arc<dyn InboxMessageHandler<T>>>;

/// Runs verify, the matching handlers and ack in one transaction.
struct InboxProcessor<D: InboxStore> {
    store: Arc<D>,
    handlers: Handlers<D::Transaction>,
    max_retries: i16,
}

impl<D: InboxStore> InboxProcessor<D> {
    async fn process(
        &self,
        message: &InboxMessage,
        tx: &mut D::Transaction,
    ) -> Result<(), InboxError> {
        verify(self.store.as_ref(), message, tx, self.max_retries).await?;
        for handler in self.handlers.iter().filter(|h| {
            h.aggregate_type() == message.aggregate_type && h.message_type() == message.message_type
        }) {
            handler
                .handle(message, tx)
                .await
                .map_err(|e| InboxError::handler(e, message.id))?;
        }
        ack(self.store.as_ref(), message, tx).await
    }
}

#[async_trait::async_trait]
impl<D: InboxStore + 'static> MessageHandler<InboxMessage> for InboxProcessor<D> {
    #[tracing::instrument(skip_all, fields(id = %message.id))]
    async fn handle(&self, message: &InboxMessage) -> Result<(), tower::BoxError> {
        execute_transaction(self.store.as_ref(), |mut tx| async move {
            let result = self.process(message, &mut tx).await;
            (tx, result)
        })
        .await
        .map_err(Into::into)
    }
}

/// Turns failed inbox messages into retries or abandonment.
struct InboxErrorResolver<D> {
    store: Arc<D>,
    max_retries: i16,
}

#[async_trait::async_trait]
impl<D: InboxStore + 'static> ErrorResolver<InboxMessage> for InboxErrorResolver<D> {
    async fn resolve(
        &self,
        error: &(dyn std::error::Error + Send + Sync + 'static),
        message: &InboxMessage,
    ) -> Resolution {
        if error
            .downcast_ref::<InboxError>()
            .is_some_and(InboxError::is_permanent)
        {
            return Resolution::Resolved;
        }

        let store = self.store.as_ref();
        let max_retries = self.max_retries;
        let outcome = execute_transaction(store, |mut tx| async move {
            let result = nack(store, message, &mut tx, max_retries).await;
            (tx, result)
        })
        .await;
        match outcome {
            Ok(NackOutcome::Retry) => Resolution::Retry,
            Ok(NackOutcome::RetriesExceeded) => Resolution::Abandoned,
            Err(err) if err.is_permanent() => Resolution::Resolved,
            Err(error) => {
                tracing::error!(%error, "Could not count the failed attempt");
                Resolution::Retry
            }
        }
    }
}

/// Builder of an inbox relay over any change log and inbox backend.
pub struct InboxRelay<L, D: InboxStore> {
    changelog: L,
    schema: String,
    table: String,
    store: Arc<D>,
    handlers: Handlers<D::Transaction>,
    max_retries: i16,
    hook: Arc<dyn RelayHook>,
    policy: ReconnectPolicy,
}

impl<L, D> InboxRelay<L, D>
where
    L: ChangeLog + 'static,
    D: InboxStore + 'static,
{
    /// Relay inserts into `schema.table` from `changelog`, updating rows through `store`.
    pub fn new(
        changelog: L,
        schema: impl Into<String>,
        table: impl Into<String>,
        store: D,
    ) -> Self {
        Self {
            changelog,
            schema: schema.into(),
            table: table.into(),
            store: Arc::new(store),
            handlers: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            hook: Arc::new(DefaultRelayHook),
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn InboxMessageHandler<D::Transaction>>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_handlers(
        mut self,
        handlers: impl IntoIterator<Item = Arc<dyn InboxMessageHandler<D::Transaction>>>,
    ) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Number of failed attempts after which a message is abandoned.
    ///
    /// Capped at [`MAX_RETRIES_LIMIT`].
    pub fn with_max_retries(mut self, max_retries: i16) -> Self {
        self.max_retries = max_retries.min(MAX_RETRIES_LIMIT);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn RelayHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start relaying on the current tokio runtime.
    pub fn start(self) -> RelayHandle {
        let processor = InboxProcessor {
            store: self.store.clone(),
            handlers: self.handlers,
            max_retries: self.max_retries,
        };
        let resolver = InboxErrorResolver {
            store: self.store,
            max_retries: self.max_retries,
        };
        let relay = Relay::new(
            self.changelog,
            self.schema,
            self.table,
            decode_inbox_message,
            processor,
            resolver,
        )
        .with_hook(self.hook);
        RelayHandle::start(Arc::new(relay), self.policy)
    }
}

#[cfg(feature = "sqlx")]
pub use pg::{InboxRelayHandle, start};

#[cfg(feature = "sqlx")]
mod pg {
    use std::sync::Arc;

    use sqlx::postgres::PgPoolOptions;
    use sqlx::{PgPool, PgTransaction};

    use super::InboxRelay;
    use crate::changelog::sqlx::PgLogicalSlot;
    use crate::config::{ConfigError, InboxServiceConfig};
    use crate::inbox::InboxMessageHandler;
    use crate::inbox::sqlx::PgInbox;
    use crate::relay::{RelayHandle, SupervisorState};

    /// Handle of an inbox relay started from its configuration.
    ///
    /// Owns the connection pools, which are closed on [`stop`](Self::stop).
    #[derive(Clone)]
    pub struct InboxRelayHandle {
        relay: RelayHandle,
        pools: Vec<PgPool>,
    }

    impl InboxRelayHandle {
        /// Stop relaying and close the connection pools.
        pub async fn stop(&self) {
            self.relay.stop().await;
            for pool in &self.pools {
                pool.close().await;
            }
        }

        pub fn state(&self) -> SupervisorState {
            self.relay.state()
        }
    }

    /// Start relaying the inbox table of `config` to `handlers`.
    ///
    /// Replication uses the `replication` connection, row updates the
    /// `connection` one. Both connect lazily.
    pub fn start(
        config: &InboxServiceConfig,
        handlers: Vec<Arc<dyn InboxMessageHandler<PgTransaction<'static>>>>,
    ) -> Result<InboxRelayHandle, ConfigError> {
        config.validate()?;
        let replication = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(config.replication.connect_options());
        let updates = PgPoolOptions::new().connect_lazy_with(config.connection.connect_options());
        let relay = InboxRelay::new(
            PgLogicalSlot::new(replication.clone(), &config.settings),
            config.settings.db_schema.clone(),
            config.settings.db_table.clone(),
            PgInbox::new(updates.clone(), &config.settings),
        )
        .with_handlers(handlers)
        .with_max_retries(config.max_retries)
        .start();
        Ok(InboxRelayHandle {
            relay,
            pools: vec![replication, updates],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeKind;
    use crate::changelog::inmemory::InMemoryChangeLog;
    use crate::inbox::Inbox;
    use crate::inbox::inmemory::{InMemoryInbox, InMemoryInboxTransaction, columns};
    use crate::inbox::tests::message;
    use crate::relay::SilentHook;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    /// Records handled ids and fails the first `failures` attempts.
    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<Uuid>>,
        failures: usize,
    }

    impl Recording {
        fn calls(&self) -> Vec<Uuid> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl InboxMessageHandler<InMemoryInboxTransaction> for Recording {
        fn aggregate_type(&self) -> &str {
            "movie"
        }

        fn message_type(&self) -> &str {
            "movie_created"
        }

        async fn handle(
            &self,
            message: &InboxMessage,
            _tx: &mut InMemoryInboxTransaction,
        ) -> Result<(), tower::BoxError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(message.id);
            if calls.len() <= self.failures {
                return Err("downstream unavailable".into());
            }
            Ok(())
        }
    }

    fn relay(
        log: &InMemoryChangeLog,
        backend: &InMemoryInbox,
        handler: &Arc<Recording>,
    ) -> InboxRelay<InMemoryChangeLog, InMemoryInbox> {
        InboxRelay::new(log.clone(), "messaging", "inbox", backend.clone())
            .with_handler(handler.clone())
            .with_hook(Arc::new(SilentHook))
            .with_reconnect_policy(
                ReconnectPolicy::default().with_restart_delay(Duration::from_millis(10)),
            )
    }

    async fn settled(log: &InMemoryChangeLog) {
        for _ in 0..200 {
            if log.pending().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("change log was not acknowledged");
    }

    #[tokio::test]
    async fn stored_messages_are_processed_once() {
        let log = InMemoryChangeLog::default();
        let backend = InMemoryInbox::new(log.clone(), "messaging", "inbox");
        let inbox = Inbox::new(backend.clone());
        let (first, second) = (message("1"), message("2"));
        inbox.store(first.clone()).await.unwrap();
        inbox.store(second.clone()).await.unwrap();
        let handler = Arc::new(Recording::default());

        let handle = relay(&log, &backend, &handler).start();
        settled(&log).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await;

        assert_eq!(handler.calls(), [first.id, second.id]);
        assert!(backend.message(first.id).await.unwrap().is_processed());
        assert!(backend.message(second.id).await.unwrap().is_processed());
    }

    #[tokio::test]
    async fn failing_handler_is_retried_until_it_succeeds() {
        let log = InMemoryChangeLog::default();
        let backend = InMemoryInbox::new(log.clone(), "messaging", "inbox");
        let msg = message("1");
        Inbox::new(backend.clone()).store(msg.clone()).await.unwrap();
        let handler = Arc::new(Recording {
            failures: 2,
            ..Default::default()
        });

        let handle = relay(&log, &backend, &handler).start();
        settled(&log).await;
        handle.stop().await;

        assert_eq!(handler.calls().len(), 3);
        let stored = backend.message(msg.id).await.unwrap();
        assert!(stored.is_processed());
        assert_eq!(stored.retries, 2);
    }

    #[tokio::test]
    async fn messages_over_the_retry_budget_are_abandoned() {
        let log = InMemoryChangeLog::default();
        let backend = InMemoryInbox::new(log.clone(), "messaging", "inbox");
        let msg = message("1");
        Inbox::new(backend.clone()).store(msg.clone()).await.unwrap();
        let handler = Arc::new(Recording {
            failures: usize::MAX,
            ..Default::default()
        });

        let handle = relay(&log, &backend, &handler).with_max_retries(1).start();
        settled(&log).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await;

        assert_eq!(handler.calls().len(), 2);
        let stored = backend.message(msg.id).await.unwrap();
        assert!(!stored.is_processed());
        assert_eq!(stored.retries, 2);
    }

    #[tokio::test]
    async fn processing_survives_an_outage() {
        let log = InMemoryChangeLog::default();
        let backend = InMemoryInbox::new(log.clone(), "messaging", "inbox");
        let inbox = Inbox::new(backend.clone());
        let (first, second) = (message("1"), message("2"));
        inbox.store(first.clone()).await.unwrap();
        inbox.store(second.clone()).await.unwrap();
        log.set_available(false).await;
        let handler = Arc::new(Recording::default());

        let handle = relay(&log, &backend, &handler)
            .with_reconnect_policy(
                ReconnectPolicy::default()
                    .with_restart_delay(Duration::from_millis(10))
                    .with_error_backoff(Duration::from_millis(5), Duration::from_millis(20)),
            )
            .start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handler.calls().is_empty());
        assert!(log.subscriptions().await > 1);

        log.set_available(true).await;
        settled(&log).await;
        handle.stop().await;

        assert_eq!(handler.calls(), [first.id, second.id]);
        assert!(backend.message(first.id).await.unwrap().is_processed());
        assert!(backend.message(second.id).await.unwrap().is_processed());
    }

    #[test]
    fn retry_budget_is_capped() {
        let relay = InboxRelay::new(
            InMemoryChangeLog::default(),
            "messaging",
            "inbox",
            InMemoryInbox::new(InMemoryChangeLog::default(), "messaging", "inbox"),
        )
        .with_max_retries(i16::MAX);

        assert_eq!(relay.max_retries, MAX_RETRIES_LIMIT);
    }

    #[tokio::test]
    async fn redelivered_messages_are_not_handled_twice() {
        let log = InMemoryChangeLog::default();
        let backend = InMemoryInbox::new(log.clone(), "messaging", "inbox");
        let msg = message("1");
        Inbox::new(backend.clone()).store(msg.clone()).await.unwrap();
        let handler = Arc::new(Recording::default());
        let handle = relay(&log, &backend, &handler).start();
        settled(&log).await;

        log.append(ChangeKind::Insert, "messaging", "inbox", columns(&msg))
            .await;
        settled(&log).await;
        handle.stop().await;

        assert_eq!(handler.calls(), [msg.id]);
    }

    #[tokio::test]
    async fn messages_without_a_row_are_skipped() {
        let log = InMemoryChangeLog::default();
        let backend = InMemoryInbox::new(log.clone(), "messaging", "inbox");
        let msg = message("1");
        log.append(ChangeKind::Insert, "messaging", "inbox", columns(&msg))
            .await;
        let handler = Arc::new(Recording::default());

        let handle = relay(&log, &backend, &handler).start();
        settled(&log).await;
        handle.stop().await;

        assert!(handler.calls().is_empty());
        assert!(backend.message(msg.id).await.is_none());
    }

    #[tokio::test]
    async fn other_message_types_are_acknowledged_without_handlers() {
        let log = InMemoryChangeLog::default();
        let backend = InMemoryInbox::new(log.clone(), "messaging", "inbox");
        let msg = InboxMessage {
            message_type: "movie_deleted".into(),
            ..message("1")
        };
        Inbox::new(backend.clone()).store(msg.clone()).await.unwrap();
        let handler = Arc::new(Recording::default());

        let handle = relay(&log, &backend, &handler).start();
        settled(&log).await;
        handle.stop().await;

        assert!(handler.calls().is_empty());
        assert!(backend.message(msg.id).await.unwrap().is_processed());
    }
}

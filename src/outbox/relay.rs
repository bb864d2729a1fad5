//! Relay of captured outbox messages to a delivery service.
//!
//! The delivery callback is a [`tower::Service`] taking an
//! [`OutboxMessage`], so any middleware stack can sit in front of the
//! message bus. Plain async closures can be adapted with
//! [`tower::service_fn`].
//!
//! A message's log position is acknowledged only after the service
//! succeeded. Failed deliveries are logged and retried by the next
//! subscription, so the service sees every message at least once.

use std::sync::Arc;

use tower::{Service, ServiceExt as _};

use crate::changelog::{ChangeLog, decode_outbox_message};
use crate::config::ReconnectPolicy;
use crate::relay::{AlwaysRetry, DefaultRelayHook, MessageHandler, Relay, RelayHandle, RelayHook};
use crate::OutboxMessage;

/// Adapts a delivery service to the relay's message handler.
struct DeliveryHandler<S> {
    service: S,
}

#[async_trait::async_trait]
impl<S> MessageHandler<OutboxMessage> for DeliveryHandler<S>
where
    S: Service<OutboxMessage> + Clone + Send + Sync + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send,
{
    async fn handle(&self, message: &OutboxMessage) -> Result<(), tower::BoxError> {
        self.service
            .clone()
            .oneshot(message.clone())
            .await
            .map(drop)
            .map_err(Into::into)
    }
}

/// Builder of an outbox relay over any change log.
pub struct OutboxRelay<L, S> {
    changelog: L,
    schema: String,
    table: String,
    service: S,
    hook: Arc<dyn RelayHook>,
    policy: ReconnectPolicy,
}

impl<L, S> OutboxRelay<L, S>
where
    L: ChangeLog + 'static,
    S: Service<OutboxMessage> + Clone + Send + Sync + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send,
{
    /// Relay inserts into `schema.table` from `changelog` to `service`.
    pub fn new(
        changelog: L,
        schema: impl Into<String>,
        table: impl Into<String>,
        service: S,
    ) -> Self {
        Self {
            changelog,
            schema: schema.into(),
            table: table.into(),
            service,
            hook: Arc::new(DefaultRelayHook),
            policy: ReconnectPolicy::default(),
        }
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
        let relay = Relay::new(
            self.changelog,
            self.schema,
            self.table,
            decode_outbox_message,
            DeliveryHandler {
                service: self.service,
            },
            AlwaysRetry,
        )
        .with_hook(self.hook);
        RelayHandle::start(Arc::new(relay), self.policy)
    }
}

#[cfg(feature = "sqlx")]
pub use pg::{OutboxRelayHandle, start};

#[cfg(feature = "sqlx")]
mod pg {
    use std::sync::{Arc, Mutex, MutexGuard};

    use sqlx::PgPool;
    use sqlx::postgres::PgPoolOptions;
    use tower::Service;

    use super::OutboxRelay;
    use crate::OutboxMessage;
    use crate::changelog::sqlx::PgLogicalSlot;
    use crate::config::{ConfigError, OutboxServiceConfig};
    use crate::relay::{RelayHandle, SupervisorState};

    type Launch = dyn Fn() -> Running + Send + Sync;

    struct Running {
        relay: RelayHandle,
        pool: PgPool,
    }

    /// Handle of an outbox relay started from its configuration.
    ///
    /// Owns the replication pool, which is closed on [`stop`](Self::stop).
    /// A stopped relay is resumed on a fresh pool.
    #[derive(Clone)]
    pub struct OutboxRelayHandle {
        running: Arc<Mutex<Running>>,
        launch: Arc<Launch>,
    }

    impl OutboxRelayHandle {
        fn running(&self) -> MutexGuard<'_, Running> {
            self.running
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        /// Stop relaying and close the replication pool.
        pub async fn stop(&self) {
            let (relay, pool) = {
                let running = self.running();
                (running.relay.clone(), running.pool.clone())
            };
            relay.stop().await;
            pool.close().await;
        }

        /// Resume the relay if it was stopped. Does nothing when it is running.
        pub fn start_if_stopped(&self) -> bool {
            let mut running = self.running();
            if running.pool.is_closed() {
                *running = (self.launch)();
                return true;
            }
            running.relay.start_if_stopped()
        }

        pub fn state(&self) -> SupervisorState {
            self.running().relay.state()
        }

        /// The replication pool of the current run.
        pub fn pool(&self) -> PgPool {
            self.running().pool.clone()
        }
    }

    fn launch<S>(config: &OutboxServiceConfig, service: S) -> Running
    where
        S: Service<OutboxMessage> + Clone + Send + Sync + 'static,
        S::Error: Into<tower::BoxError>,
        S::Future: Send,
    {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(config.replication.connect_options());
        let relay = OutboxRelay::new(
            PgLogicalSlot::new(pool.clone(), &config.settings),
            config.settings.db_schema.clone(),
            config.settings.db_table.clone(),
            service,
        )
        .start();
        Running { relay, pool }
    }

    /// Start relaying the outbox table of `config` from its PostgreSQL
    /// replication slot to `service`.
    ///
    /// The connection is established lazily, so the relay also starts while
    /// the database is unreachable and catches up once it is back.
    pub fn start<S>(
        config: &OutboxServiceConfig,
        service: S,
    ) -> Result<OutboxRelayHandle, ConfigError>
    where
        S: Service<OutboxMessage> + Clone + Send + Sync + 'static,
        S::Error: Into<tower::BoxError>,
        S::Future: Send,
    {
        config.validate()?;
        let config = config.clone();
        let running = launch(&config, service.clone());
        Ok(OutboxRelayHandle {
            running: Arc::new(Mutex::new(running)),
            launch: Arc::new(move || launch(&config, service.clone())),
        })
    }

}

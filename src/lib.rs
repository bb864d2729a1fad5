#![doc = include_str!("../README.md")]

pub mod changelog;
pub mod config;
pub mod inbox;
pub mod message;
pub mod outbox;
pub mod relay;
pub mod transaction;

#[doc(inline)]
pub use message::{
    AttemptedMessage, InboxMessage, MessageError, MessageErrorKind, OutboxMessage,
};

#[doc(inline)]
pub use config::{
    ConfigError, InboxServiceConfig, OutboxServiceConfig, PgConnectionConfig, ReconnectPolicy,
    ServiceSettings,
};

#[doc(inline)]
pub use outbox::{Outbox, OutboxStorage, OutboxStore, relay::OutboxRelay};

#[doc(inline)]
pub use inbox::{
    Inbox, InboxError, InboxErrorKind, InboxMessageHandler, InboxStore, NackOutcome,
    relay::InboxRelay,
};

#[doc(inline)]
pub use relay::{DefaultRelayHook, RelayHandle, RelayHook, SilentHook, SupervisorState};

#[doc(inline)]
pub use transaction::{Transactional, execute_transaction};

//! Relay configuration.
//!
//! The outbox and inbox relays take two disjoint configuration types. Both
//! are plain `serde` structs so hosts can load them from any format, and both
//! are validated when a relay starts.

use std::time::Duration;

use serde::Deserialize;

/// Default number of failed handler attempts before an inbox message is abandoned.
pub const DEFAULT_MAX_RETRIES: i16 = 5;

/// Largest retry budget. The counter column is a `smallint` and must be able
/// to count one attempt past the budget.
pub const MAX_RETRIES_LIMIT: i16 = i16::MAX - 1;

/// PostgreSQL connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PgConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_port() -> u16 {
    5432
}

impl PgConnectionConfig {
    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        for (name, value) in [
            ("host", &self.host),
            ("database", &self.database),
            ("user", &self.user),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::missing(format!("{field}.{name}")));
            }
        }
        if self.port == 0 {
            return Err(ConfigError::invalid(format!("{field}.port"), "must not be 0"));
        }
        Ok(())
    }

    /// Connect options for a sqlx pool.
    #[cfg(feature = "sqlx")]
    pub fn connect_options(&self) -> sqlx::postgres::PgConnectOptions {
        let options = sqlx::postgres::PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user);
        match &self.password {
            Some(password) => options.password(password),
            None => options,
        }
    }
}

/// Names of the watched table and its replication objects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSettings {
    pub db_schema: String,
    pub db_table: String,
    pub postgres_pub: String,
    pub postgres_slot: String,
}

impl ServiceSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("settings.db_schema", &self.db_schema),
            ("settings.db_table", &self.db_table),
            ("settings.postgres_pub", &self.postgres_pub),
            ("settings.postgres_slot", &self.postgres_slot),
        ] {
            validate_identifier(name, value)?;
        }
        Ok(())
    }

    /// The schema-qualified table name, safe to interpolate into SQL once validated.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.db_schema, self.db_table)
    }
}

/// Configuration of the outbox relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutboxServiceConfig {
    /// Connection of the role with replication permission.
    pub replication: PgConnectionConfig,
    pub settings: ServiceSettings,
}

impl OutboxServiceConfig {
    /// Reject missing or malformed settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.replication.validate("replication")?;
        self.settings.validate()
    }
}

/// Configuration of the inbox relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboxServiceConfig {
    /// Connection of the role with replication permission.
    pub replication: PgConnectionConfig,
    /// Connection of the role allowed to update the inbox table.
    pub connection: PgConnectionConfig,
    pub settings: ServiceSettings,
    #[serde(default = "default_max_retries")]
    pub max_retries: i16,
}

fn default_max_retries() -> i16 {
    DEFAULT_MAX_RETRIES
}

impl InboxServiceConfig {
    /// Reject missing or malformed settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.replication.validate("replication")?;
        self.connection.validate("connection")?;
        self.settings.validate()?;
        if self.max_retries < 0 {
            return Err(ConfigError::invalid("max_retries", "must not be negative"));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::invalid(
                "max_retries",
                format!("must be at most {MAX_RETRIES_LIMIT}"),
            ));
        }
        Ok(())
    }
}

/// Restart timing of the relay supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectPolicy {
    /// Delay before resubscribing after a subscription ended cleanly.
    #[serde(with = "millis", default = "default_restart_delay")]
    pub restart_delay: Duration,
    /// Delay before the first resubscription after an error.
    #[serde(with = "millis", default)]
    pub error_backoff_initial: Duration,
    /// Upper bound of the doubling error backoff.
    #[serde(with = "millis", default = "default_error_backoff_max")]
    pub error_backoff_max: Duration,
}

fn default_restart_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_error_backoff_max() -> Duration {
    Duration::from_secs(5)
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            restart_delay: default_restart_delay(),
            error_backoff_initial: Duration::ZERO,
            error_backoff_max: default_error_backoff_max(),
        }
    }
}

impl ReconnectPolicy {
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_error_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.error_backoff_initial = initial;
        self.error_backoff_max = max;
        self
    }

    /// Delay before the next attempt after `failures` consecutive subscription errors.
    pub fn error_delay(&self, failures: u32) -> Duration {
        if failures <= 1 {
            return self.error_backoff_initial.min(self.error_backoff_max);
        }
        let base = if self.error_backoff_initial.is_zero() {
            Duration::from_millis(50)
        } else {
            self.error_backoff_initial
        };
        let factor = 1u32.checked_shl(failures - 2).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(self.error_backoff_max)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Accepts plain, unquoted SQL identifiers.
fn validate_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start {
        return Err(if value.is_empty() {
            ConfigError::missing(field)
        } else {
            ConfigError::invalid(field, "must start with a letter or underscore")
        });
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::invalid(
            field,
            "may only contain letters, digits and underscores",
        ));
    }
    if value.len() > 63 {
        return Err(ConfigError::invalid(field, "exceeds 63 characters"));
    }
    Ok(())
}

/// Configuration rejected at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing { field: String },
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn missing(field: impl Into<String>) -> Self {
        Self::Missing {
            field: field.into(),
        }
    }

    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing { field } => write!(f, "Missing configuration value: {field}"),
            ConfigError::Invalid { field, reason } => {
                write!(f, "Invalid configuration value {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn connection() -> PgConnectionConfig {
        PgConnectionConfig {
            host: "localhost".into(),
            port: 5432,
            database: "app".into(),
            user: "app_login".into(),
            password: Some("secret".into()),
        }
    }

    pub(crate) fn settings(table: &str) -> ServiceSettings {
        ServiceSettings {
            db_schema: "messaging".into(),
            db_table: table.into(),
            postgres_pub: format!("pg_transactional_{table}_pub"),
            postgres_slot: format!("pg_transactional_{table}_slot"),
        }
    }

    pub(crate) fn inbox_config() -> InboxServiceConfig {
        InboxServiceConfig {
            replication: connection(),
            connection: connection(),
            settings: settings("inbox"),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    #[test]
    fn parses_inbox_config_with_defaults() {
        let config: InboxServiceConfig = serde_json::from_value(serde_json::json!({
            "replication": { "host": "db", "database": "app", "user": "repl" },
            "connection": { "host": "db", "database": "app", "user": "login", "password": "pw" },
            "settings": {
                "db_schema": "messaging",
                "db_table": "inbox",
                "postgres_pub": "inbox_pub",
                "postgres_slot": "inbox_slot"
            }
        }))
        .unwrap();

        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.replication.port, 5432);
        assert_eq!(config.settings.qualified_table(), "messaging.inbox");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_fields() {
        let parsed = serde_json::from_value::<OutboxServiceConfig>(serde_json::json!({
            "replication": { "host": "db", "database": "app", "user": "repl" },
            "settings": {
                "db_schema": "messaging",
                "db_table": "outbox",
                "postgres_pub": "pub",
                "postgres_slot": "slot",
                "outboxSchema": "messaging"
            }
        }));

        assert!(parsed.is_err());
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let mut config = OutboxServiceConfig {
            replication: connection(),
            settings: settings("outbox"),
        };
        config.settings.db_table = "outbox; DROP TABLE users".into();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "settings.db_table"
        ));
    }

    #[test]
    fn rejects_missing_values() {
        let mut config = inbox_config();
        config.connection.user = " ".into();
        assert_eq!(
            config.validate(),
            Err(ConfigError::Missing {
                field: "connection.user".into()
            })
        );

        let mut config = inbox_config();
        config.settings.postgres_slot = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::Missing { .. })));

        let mut config = inbox_config();
        config.max_retries = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_budget_leaves_room_for_one_more_attempt() {
        let mut config = inbox_config();
        config.max_retries = i16::MAX;
        assert!(config.validate().is_err());

        config.max_retries = MAX_RETRIES_LIMIT;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn error_backoff_doubles_up_to_the_maximum() {
        let policy = ReconnectPolicy::default()
            .with_error_backoff(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.error_delay(1), Duration::from_millis(100));
        assert_eq!(policy.error_delay(2), Duration::from_millis(100));
        assert_eq!(policy.error_delay(3), Duration::from_millis(200));
        assert_eq!(policy.error_delay(4), Duration::from_millis(400));
        assert_eq!(policy.error_delay(5), Duration::from_millis(500));
        assert_eq!(policy.error_delay(60), Duration::from_millis(500));
    }

    #[test]
    fn first_error_restarts_immediately_by_default() {
        let policy = ReconnectPolicy::default();

        assert_eq!(policy.error_delay(1), Duration::ZERO);
        assert_eq!(policy.error_delay(2), Duration::from_millis(50));
    }
}

use thiserror::Error;

pub type Result<T> = core::result::Result<T, BigBrotrError>;

/// Top-level error for all BigBrotr operations.
///
/// Every variant carries a specific kind so callers can distinguish
/// transient failures (retry with backoff) from permanent ones (fail
/// fast) and keep per-relay failures isolated from the service cycle.
#[derive(Error, Debug)]
pub enum BigBrotrError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Connectivity error: {0}")]
    Connectivity(#[from] ConnectivityError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Publishing error: {0}")]
    Publishing(#[from] PublishingError),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Nostr key error: {0}")]
    NostrKey(#[from] nostr_sdk::key::Error),

    #[error("Nostr client error: {0}")]
    NostrClient(#[from] nostr_sdk::client::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Invalid or missing configuration (YAML, env vars, CLI flags).
///
/// Fatal at startup; never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Database failures, split by retryability.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Transient: pool exhausted, connection refused, network blip.
    /// Callers may retry after a backoff.
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Permanent: bad SQL, constraint violation, data integrity.
    /// Callers must NOT retry; the query itself is wrong.
    #[error("Query error: {0}")]
    Query(String),

    #[error("Pool is not connected")]
    NotConnected,

    #[error("Batch of {got} rows exceeds max_batch_size {max}")]
    BatchTooLarge { got: usize, max: usize },

    #[error("Invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient_sqlx(&err) {
            DatabaseError::Pool(err.to_string())
        } else {
            DatabaseError::Query(err.to_string())
        }
    }
}

/// Transient errors come from the connection layer; anything the server
/// rejected (bad SQL, constraint violation) is permanent.
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
    )
}

/// Relay/network connectivity failures.
#[derive(Error, Debug)]
pub enum ConnectivityError {
    #[error("Connection timeout: {relay}")]
    Timeout { relay: String },

    #[error("SSL certificate verification failed for {relay}: {reason}")]
    Ssl { relay: String, reason: String },

    #[error("Connection failed: {relay} ({reason})")]
    Failed { relay: String, reason: String },

    #[error("proxy_url required for {network} relay: {relay}")]
    ProxyRequired { network: String, relay: String },
}

/// NIP parsing, validation, or compliance failure. Per-relay; other
/// relays are unaffected.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid relay URL {url:?}: {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid metadata payload: {0}")]
    InvalidMetadata(String),

    #[error("Invalid service state: {0}")]
    InvalidServiceState(String),
}

/// Failed to broadcast a Nostr event to a relay. Logged and counted;
/// other relays still receive the event.
#[derive(Error, Debug)]
#[error("Broadcast to {relay} failed: {reason}")]
pub struct PublishingError {
    pub relay: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_io_error_is_transient() {
        let err = sqlx::Error::Io(std::io::Error::other("connection reset"));
        assert!(matches!(DatabaseError::from(err), DatabaseError::Pool(_)));
    }

    #[test]
    fn sqlx_pool_timeout_is_transient() {
        assert!(matches!(
            DatabaseError::from(sqlx::Error::PoolTimedOut),
            DatabaseError::Pool(_)
        ));
    }

    #[test]
    fn sqlx_row_not_found_is_permanent() {
        assert!(matches!(
            DatabaseError::from(sqlx::Error::RowNotFound),
            DatabaseError::Query(_)
        ));
    }

    #[test]
    fn config_error_display_includes_field() {
        let err = ConfigError::invalid("pool.max_size", "must be >= min_size");
        assert!(err.to_string().contains("pool.max_size"));
    }

    #[test]
    fn errors_nest_into_top_level() {
        let err: BigBrotrError = DatabaseError::NotConnected.into();
        assert!(err.to_string().contains("not connected"));
    }
}

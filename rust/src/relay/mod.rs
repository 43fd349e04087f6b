//! Relay connections and the pool that fans requests out over them

use std::time::Duration;

use pika_relay_profiles::RelayUrlError;

pub mod backoff;
pub mod connection;
pub mod pool;
mod seen;
pub mod status;

pub use self::backoff::{ReconnectDecision, ReconnectPolicy};
pub use self::connection::Connection;
pub use self::pool::{
    PublishOptions, PublishOutput, PublishResult, QueryOptions, QueryOutput, ReconcileReport,
    RelayEvent, RelayInfo, RelayPool, RelaySubscription,
};
pub use self::status::{ConnectionStatus, StatusChange, StatusSubscription};

/// Relay error
///
/// Connection-level failures are retried by the connection itself; these
/// values only show up inside per-relay results.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connection refused: {0}")]
    ConnectRefused(String),
    /// No EOSE before the query deadline. Partial results are still returned.
    #[error("query timed out after {0:?}")]
    QueryTimeout(Duration),
    #[error("publish timed out after {0:?}")]
    PublishTimeout(Duration),
    #[error("connection closed")]
    ConnectionClosed,
    /// Relay answered `OK` with `false`
    #[error("rejected by relay: {0}")]
    Rejected(String),
    #[error(transparent)]
    InvalidEndpoint(#[from] RelayUrlError),
}

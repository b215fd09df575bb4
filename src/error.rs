//! Error types

use thiserror::Error;

/// Errors raised when delivering a protocol message to a peer.
///
/// A failed send is never fatal for the protocol: the peer's execution
/// simply times out while the other executions continue.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request to {address} failed: {source}")]
    Request {
        address: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("peer {address} answered with status {status}")]
    Status { address: String, status: u16 },
}

/// Errors raised while loading the node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("agreement divisor must be at least 1")]
    ZeroDivisor,
}

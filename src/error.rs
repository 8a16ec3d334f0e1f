//! Error types for geerpc.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all geerpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (option handshake and the JSON codec).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary codec serialization error.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Binary codec deserialization error.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// HTTP error talking to the registry.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Protocol violation (bad magic number, unknown codec, oversized
    /// record, malformed handshake or HTTP head).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection died underneath in-flight calls.
    #[error("connection error: {0}")]
    Transport(String),

    /// Error string carried back in a response header.
    ///
    /// Displays as the bare message so it does not grow a prefix on
    /// every hop through the wire.
    #[error("{0}")]
    Remote(String),

    /// The client was closed, or its connection has already failed.
    #[error("connection is shut down")]
    Shutdown,

    /// The call was cancelled before a response arrived.
    #[error("call cancelled")]
    Cancelled,

    /// Connection establishment exceeded the configured timeout.
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    /// An address that does not match `protocol@host:port`.
    #[error("rpc client: wrong address format '{0}', expect protocol@addr")]
    InvalidAddress(String),

    /// A service/method string without a dot separator.
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    /// No service registered under the requested name.
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    /// The service exists but has no such method.
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    /// A second registration under an already-taken service name.
    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),

    /// Service names must be exported identifiers.
    #[error("rpc: {0} is not a valid service name")]
    InvalidServiceName(String),

    /// Discovery produced an empty server list.
    #[error("rpc discovery: no available servers")]
    NoAvailableServers,

    /// The registry answered with something unusable.
    #[error("rpc registry: {0}")]
    Registry(String),
}

/// Result type alias using [`RpcError`].
pub type Result<T> = std::result::Result<T, RpcError>;

//! Stream transports.
//!
//! The framework runs over any bidirectional byte stream. [`Connection`]
//! is the blanket trait the protocol layers are written against, and
//! [`connect`] dials the networks `xdial` addresses can name.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::error::{Result, RpcError};

/// A bidirectional byte stream usable as an RPC connection.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Type-erased connection, so one [`crate::Client`] can sit on top of
/// TCP, Unix sockets, or an in-memory duplex in tests.
pub type BoxedConn = Box<dyn Connection>;

/// Dial `address` over the named network (`tcp` or `unix`).
///
/// A non-zero `connect_timeout` bounds the dial; zero waits forever.
pub async fn connect(network: &str, address: &str, connect_timeout: Duration) -> Result<BoxedConn> {
    let dial = dial(network, address);
    if connect_timeout.is_zero() {
        return dial.await;
    }
    match tokio::time::timeout(connect_timeout, dial).await {
        Ok(conn) => conn,
        Err(_) => Err(RpcError::ConnectTimeout(connect_timeout)),
    }
}

async fn dial(network: &str, address: &str) -> Result<BoxedConn> {
    match network {
        "tcp" => {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => {
            let stream = UnixStream::connect(address).await?;
            Ok(Box::new(stream))
        }
        other => Err(RpcError::Protocol(format!(
            "unsupported network '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_rejects_unknown_network() {
        let err = connect("carrier-pigeon", "127.0.0.1:1", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[tokio::test]
    async fn connect_reports_timeout() {
        // RFC 5737 TEST-NET address, nothing routes there.
        let err = connect("tcp", "192.0.2.1:65000", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::ConnectTimeout(_) | RpcError::Io(_)
        ));
    }
}

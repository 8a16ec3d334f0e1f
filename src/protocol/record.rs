//! Length-prefixed records.
//!
//! Every header and every body after the handshake travels as one
//! record: a `u32` big-endian length followed by that many payload
//! bytes. The framing is codec-independent, which is what lets a peer
//! skip a body it cannot or does not want to decode without losing its
//! place in the stream.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};

/// Default maximum record size (16 MB). A length prefix beyond this is
/// treated as stream corruption, not as a request for 4 GB of buffer.
pub const DEFAULT_MAX_RECORD_SIZE: u32 = 16 * 1024 * 1024;

/// Read one record.
pub(crate) async fn read_record<R>(io: &mut R, max_size: u32) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > max_size {
        return Err(RpcError::Protocol(format!(
            "record of {len} bytes exceeds the {max_size} byte limit"
        )));
    }

    let mut payload = BytesMut::zeroed(len as usize);
    io.read_exact(&mut payload).await?;
    Ok(payload.freeze())
}

/// Write one record. The caller flushes.
pub(crate) async fn write_record<W>(io: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    io.write_all(payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_record(&mut client, b"hello").await.unwrap();
        client.flush().await.unwrap();

        let record = read_record(&mut server, DEFAULT_MAX_RECORD_SIZE)
            .await
            .unwrap();
        assert_eq!(&record[..], b"hello");
    }

    #[tokio::test]
    async fn empty_record_is_valid() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_record(&mut client, b"").await.unwrap();
        client.flush().await.unwrap();

        let record = read_record(&mut server, DEFAULT_MAX_RECORD_SIZE)
            .await
            .unwrap();
        assert!(record.is_empty());
    }

    #[tokio::test]
    async fn oversized_record_is_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let err = read_record(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_record_is_an_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_record(&mut client, b"partial").await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        // First record is fine, the next length read hits EOF.
        read_record(&mut server, 1024).await.unwrap();
        let err = read_record(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
    }
}

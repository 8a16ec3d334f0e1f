//! Connection options and the JSON handshake line.
//!
//! The client opens every connection by sending one [`Options`] value as
//! a single `\n`-terminated line of JSON. Keeping the handshake
//! line-delimited lets the server consume exactly the handshake and not
//! a byte more, so the codec records that follow stay intact.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::CodecType;
use crate::error::{Result, RpcError};
use crate::protocol::MAGIC_NUMBER;

/// Upper bound on the handshake line; anything longer is not a
/// handshake.
const MAX_OPTIONS_LINE: usize = 4 * 1024;

/// Per-connection options, negotiated once before any frame.
///
/// The caller's values are sent as-is: a wrong `magic_number` really
/// goes on the wire and really gets the connection closed by the
/// server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    /// Must be [`MAGIC_NUMBER`].
    pub magic_number: u32,
    /// Name of the codec for everything after the handshake,
    /// e.g. `"application/gob"`.
    pub codec_type: String,
    /// Bound on dialing plus client construction. Zero waits forever.
    #[serde(default)]
    pub connect_timeout: Duration,
    /// Server-side bound on handling one request. Zero means no bound.
    #[serde(default)]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::Binary.name().to_string(),
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    /// Default options with a different codec.
    pub fn with_codec(codec: CodecType) -> Self {
        Self {
            codec_type: codec.name().to_string(),
            ..Self::default()
        }
    }
}

/// Write the handshake line.
pub(crate) async fn write_options<W>(io: &mut W, options: &Options) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(options)?;
    line.push(b'\n');
    io.write_all(&line).await?;
    io.flush().await?;
    Ok(())
}

/// Read the handshake line.
///
/// Reads byte by byte so nothing past the terminating `\n` is consumed;
/// the handshake happens once per connection, so the extra syscalls do
/// not matter.
pub(crate) async fn read_options<R>(io: &mut R) -> Result<Options>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    loop {
        let byte = io.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_OPTIONS_LINE {
            return Err(RpcError::Protocol(
                "option handshake line too long".to_string(),
            ));
        }
    }
    Ok(serde_json::from_slice(&line)?)
}

//! RPC client: per-connection request multiplexer.
//!
//! One [`Client`] owns one connection and any number of in-flight
//! calls. Two locks keep it honest, always taken in this order:
//!
//! - the **send lock** (async mutex around the codec writer) serializes
//!   wire writes and is held across call registration, so requests go
//!   out in `seq` order;
//! - the **state lock** (plain mutex around the sequence counter, the
//!   pending table and the shutdown flags) is only ever taken inside
//!   the send lock or on its own, never the other way around.
//!
//! A single background task reads responses and completes pending calls
//! through their oneshot channels; responses may arrive in any order,
//! correspondence is by `seq` alone. Dropping an incomplete [`Call`]
//! unregisters it, which is what makes
//! `tokio::time::timeout(d, client.call(..))` a safe cancellation
//! surface: the late response is simply discarded by the receive loop.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::codec::{CodecReader, CodecType, CodecWriter};
use crate::error::{Result, RpcError};
use crate::http;
use crate::protocol::{write_options, Header, Options};
use crate::transport::{self, BoxedConn};

type ClientReader = CodecReader<ReadHalf<BoxedConn>>;
type ClientWriter = CodecWriter<BufWriter<WriteHalf<BoxedConn>>>;

/// What the receive loop hands a waiting call: the raw reply bytes, or
/// the error that ended the call.
type CallOutcome = Result<Bytes>;

struct ClientState {
    /// Next sequence number; starts at 1 and never wraps in practice.
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<CallOutcome>>,
    /// Set by [`Client::close`].
    closing: bool,
    /// Set when the connection has failed underneath us.
    shutdown: bool,
}

/// State shared between the client handle, its receive loop, and
/// outstanding [`Call`]s.
struct Shared {
    /// `None` once [`Client::close`] has released the write half.
    send: Mutex<Option<ClientWriter>>,
    state: StdMutex<ClientState>,
}

impl Shared {
    /// Allocate a seq and park a completion slot for it.
    fn register_call(&self) -> Result<(u64, oneshot::Receiver<CallOutcome>)> {
        let mut state = self.state.lock().unwrap();
        if state.closing || state.shutdown {
            return Err(RpcError::Shutdown);
        }
        let seq = state.seq;
        state.seq += 1;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(seq, tx);
        Ok((seq, rx))
    }

    /// Remove a pending call. Removal races completion and repeated
    /// removal; both are safe, whoever gets the sender out decides the
    /// call's fate and everyone else sees `None`.
    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<CallOutcome>> {
        self.state.lock().unwrap().pending.remove(&seq)
    }

    /// Fail every pending call and refuse new ones. Takes the send lock
    /// first so no sender is mid-registration while the table drains.
    /// The pending table is empty afterwards.
    async fn terminate_calls(&self, err: RpcError) {
        let _send = self.send.lock().await;
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        for (_, tx) in state.pending.drain() {
            let failure = match &err {
                RpcError::Shutdown => RpcError::Shutdown,
                other => RpcError::Transport(other.to_string()),
            };
            let _ = tx.send(Err(failure));
        }
    }
}

/// An in-flight call. Await [`Call::wait`] for the reply; drop it to
/// abandon the call.
pub struct Call<R> {
    seq: u64,
    rx: oneshot::Receiver<CallOutcome>,
    codec: CodecType,
    shared: Arc<Shared>,
    finished: bool,
    _reply: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> Call<R> {
    /// Wait for the response and decode the reply.
    pub async fn wait(mut self) -> Result<R> {
        let outcome = (&mut self.rx).await;
        self.finished = true;
        match outcome {
            Ok(Ok(body)) => self.codec.decode(&body),
            Ok(Err(err)) => Err(err),
            // The sender can only disappear without a value if the
            // client was torn down wholesale.
            Err(_) => Err(RpcError::Shutdown),
        }
    }
}

impl<R> Call<R> {
    /// Sequence number assigned to this call.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl<R> Drop for Call<R> {
    fn drop(&mut self) {
        if !self.finished {
            // Abandoned before completion: unregister so the eventual
            // response is discarded by the receive loop.
            self.shared.remove_call(self.seq);
        }
    }
}

/// RPC client over one connection.
pub struct Client {
    codec: CodecType,
    shared: Arc<Shared>,
    receive_task: JoinHandle<()>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Build a client on an established connection: send the option
    /// line, then start the receive loop.
    pub async fn new(conn: BoxedConn, options: &Options) -> Result<Self> {
        let codec = CodecType::from_name(&options.codec_type).ok_or_else(|| {
            RpcError::Protocol(format!("invalid codec type {}", options.codec_type))
        })?;

        let (read_half, mut write_half) = tokio::io::split(conn);
        write_options(&mut write_half, options).await?;

        let shared = Arc::new(Shared {
            send: Mutex::new(Some(CodecWriter::new(BufWriter::new(write_half), codec))),
            state: StdMutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });

        let reader = CodecReader::new(read_half, codec);
        let receive_task = tokio::spawn(receive_loop(reader, Arc::clone(&shared)));

        Ok(Self {
            codec,
            shared,
            receive_task,
        })
    }

    /// Build a client on a connection that first needs the HTTP CONNECT
    /// handshake.
    pub async fn new_http(mut conn: BoxedConn, options: &Options) -> Result<Self> {
        http::client_handshake(&mut conn, http::DEFAULT_RPC_PATH).await?;
        Self::new(conn, options).await
    }

    /// Dial `address` over `network` (`tcp` or `unix`) and build a
    /// client on the connection.
    ///
    /// Both the dial and the post-dial construction race
    /// `options.connect_timeout`; a timed-out construction future is
    /// dropped, taking its half-built connection with it.
    pub async fn dial(network: &str, address: &str, options: Options) -> Result<Self> {
        let conn = transport::connect(network, address, options.connect_timeout).await?;
        with_connect_timeout(options.connect_timeout, Self::new(conn, &options)).await
    }

    /// Dial an RPC server reached through an HTTP CONNECT tunnel.
    pub async fn dial_http(network: &str, address: &str, options: Options) -> Result<Self> {
        let conn = transport::connect(network, address, options.connect_timeout).await?;
        with_connect_timeout(options.connect_timeout, Self::new_http(conn, &options)).await
    }

    /// Dial a `"protocol@host:port"` address; `http` takes the CONNECT
    /// path, anything else dials that protocol raw.
    pub async fn xdial(rpc_addr: &str, options: Options) -> Result<Self> {
        let (protocol, addr) = rpc_addr
            .split_once('@')
            .ok_or_else(|| RpcError::InvalidAddress(rpc_addr.to_string()))?;
        match protocol {
            "http" => Self::dial_http("tcp", addr, options).await,
            _ => Self::dial(protocol, addr, options).await,
        }
    }

    /// Issue a call and return a handle for the response.
    ///
    /// A wire-write failure still yields a handle; the call completes
    /// immediately with the error, so there is exactly one completion
    /// either way.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> Result<Call<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = self.codec.encode(args)?;
        self.go_encoded(service_method, body).await
    }

    pub(crate) async fn go_encoded<R: DeserializeOwned>(
        &self,
        service_method: &str,
        body: Vec<u8>,
    ) -> Result<Call<R>> {
        let mut sender = self.shared.send.lock().await;
        let (seq, rx) = self.shared.register_call()?;

        let header = Header::request(service_method, seq);
        let written = match sender.as_mut() {
            // The writer is gone once close() has run; registration
            // rejects that case first.
            Some(writer) => writer.write_raw(&header, &body).await,
            None => Err(RpcError::Shutdown),
        };
        if let Err(err) = written {
            if let Some(tx) = self.shared.remove_call(seq) {
                let failure = match err {
                    RpcError::Shutdown => RpcError::Shutdown,
                    other => RpcError::Transport(other.to_string()),
                };
                let _ = tx.send(Err(failure));
            }
        }
        drop(sender);

        Ok(Call {
            seq,
            rx,
            codec: self.codec,
            shared: Arc::clone(&self.shared),
            finished: false,
            _reply: PhantomData,
        })
    }

    /// Call `service_method` and wait for the reply.
    ///
    /// Wrap in [`tokio::time::timeout`] (or select against any other
    /// cancellation signal) to bound the wait; abandoning the future
    /// unregisters the call.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await?.wait().await
    }

    pub(crate) async fn call_encoded<R: DeserializeOwned>(
        &self,
        service_method: &str,
        body: Vec<u8>,
    ) -> Result<R> {
        self.go_encoded(service_method, body).await?.wait().await
    }

    /// True while the client can still issue calls.
    pub fn is_available(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        !state.shutdown && !state.closing
    }

    /// Close the connection: flush and release the write half, stop the
    /// receive loop, and fail every call still in flight with
    /// [`RpcError::Shutdown`]. The pending table is empty when this
    /// returns; nothing waits on the peer noticing. Calling again
    /// returns [`RpcError::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        let flushed = {
            let mut sender = self.shared.send.lock().await;
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.closing {
                    return Err(RpcError::Shutdown);
                }
                state.closing = true;
            }
            let flushed = match sender.as_mut() {
                Some(writer) => writer.shutdown().await,
                None => Ok(()),
            };
            // Dropping the writer releases our half of the socket;
            // aborting the receive loop below releases the other.
            *sender = None;
            flushed
        };

        // End the receive loop's blocked read locally instead of
        // waiting for the peer to react to our FIN.
        self.receive_task.abort();
        self.shared.terminate_calls(RpcError::Shutdown).await;
        flushed
    }
}

async fn with_connect_timeout<F>(timeout: std::time::Duration, fut: F) -> Result<Client>
where
    F: std::future::Future<Output = Result<Client>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::ConnectTimeout(timeout)),
    }
}

/// Single consumer of the connection's read half.
///
/// Three cases per response: no pending entry (the call was abandoned;
/// discard the body), an error header (discard the body, fail the
/// call), or success (hand the raw body to the waiter, which decodes it
/// where the reply type is known). Any transport-level error ends the
/// loop and fails everything still pending.
async fn receive_loop(mut reader: ClientReader, shared: Arc<Shared>) {
    let err = loop {
        let header = match reader.read_header().await {
            Ok(header) => header,
            Err(err) => break err,
        };

        let slot = shared.remove_call(header.seq);
        match slot {
            None => {
                if let Err(err) = reader.read_body().await {
                    break err;
                }
            }
            Some(tx) => {
                if header.error.is_empty() {
                    match reader.read_body().await {
                        Ok(body) => {
                            let _ = tx.send(Ok(body));
                        }
                        Err(err) => {
                            let _ = tx.send(Err(RpcError::Transport(err.to_string())));
                            break err;
                        }
                    }
                } else {
                    let body = reader.read_body().await;
                    let _ = tx.send(Err(RpcError::Remote(header.error)));
                    if let Err(err) = body {
                        break err;
                    }
                }
            }
        }
    };
    shared.terminate_calls(err).await;
}

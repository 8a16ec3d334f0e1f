//! RPC server: accept loop, option handshake, per-connection request
//! loop and concurrent request handling.
//!
//! Connection lifecycle:
//!
//! 1. Read the option line; reject bad magic or an unknown codec by
//!    closing the connection.
//! 2. Split the stream. The receive side is driven by the request loop;
//!    the send side goes behind a mutex shared by all handler tasks, so
//!    two handlers may compute concurrently but never interleave bytes
//!    on the wire.
//! 3. Each well-routed request runs in its own task; exactly one
//!    response goes out per request, carrying the request's `seq`. A
//!    routing failure still consumes the body record (framing stays
//!    intact) and answers in-band with the error.
//! 4. On EOF the loop drains in-flight handlers, then closes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::codec::{CodecReader, CodecType, CodecWriter};
use crate::error::{Result, RpcError};
use crate::protocol::{read_options, Header, MAGIC_NUMBER};
use crate::service::{split_service_method, BoxFuture, Service};

/// RPC server holding the registered services.
///
/// Cheap to share: wrap it in an [`Arc`] and hand clones to however
/// many listeners it should serve.
#[derive(Default)]
pub struct Server {
    services: DashMap<String, Arc<Service>>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. Duplicate names are a hard error.
    pub fn register(&self, service: Service) -> Result<()> {
        match self.services.entry(service.name().to_string()) {
            Entry::Occupied(_) => Err(RpcError::DuplicateService(service.name().to_string())),
            Entry::Vacant(slot) => {
                tracing::info!(service = service.name(), "rpc server: register service");
                slot.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// Accept connections until the listener fails.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let _ = stream.set_nodelay(true);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.serve_conn(stream).await });
                }
                Err(err) => {
                    tracing::error!(error = %err, "rpc server: accept error");
                    return;
                }
            }
        }
    }

    /// Serve one already-established connection.
    pub async fn serve_conn<C>(&self, mut conn: C)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let options = match read_options(&mut conn).await {
            Ok(options) => options,
            Err(err) => {
                tracing::warn!(error = %err, "rpc server: options error");
                return;
            }
        };
        if options.magic_number != MAGIC_NUMBER {
            tracing::warn!(
                magic = format_args!("{:#x}", options.magic_number),
                "rpc server: invalid magic number"
            );
            return;
        }
        let Some(codec) = CodecType::from_name(&options.codec_type) else {
            tracing::warn!(
                codec = %options.codec_type,
                "rpc server: not supporting codec type"
            );
            return;
        };

        self.serve_codec(codec, conn, options.handle_timeout).await;
    }

    async fn serve_codec<C>(&self, codec: CodecType, conn: C, handle_timeout: Duration)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(conn);
        let mut reader = CodecReader::new(read_half, codec);
        let writer = Arc::new(Mutex::new(CodecWriter::new(
            BufWriter::new(write_half),
            codec,
        )));
        let mut handlers = JoinSet::new();

        loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(err) => {
                    if !is_clean_eof(&err) {
                        tracing::error!(error = %err, "rpc server: read header error");
                    }
                    break;
                }
            };

            // The body record is consumed no matter how routing went,
            // otherwise the next header read would land mid-body.
            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(err) => {
                    tracing::error!(error = %err, "rpc server: read body error");
                    break;
                }
            };

            match self.route(&header.service_method, codec, &body) {
                Ok(invocation) => {
                    handlers.spawn(handle_request(
                        invocation,
                        header,
                        Arc::clone(&writer),
                        handle_timeout,
                    ));
                }
                Err(err) => {
                    let mut header = header;
                    header.error = err.to_string();
                    send_response(&writer, &header, &[]).await;
                }
            }
        }

        // Drain in-flight handlers before tearing the connection down.
        while handlers.join_next().await.is_some() {}
        let _ = writer.lock().await.shutdown().await;
    }

    /// Resolve `"Service.Method"` into an invocation future.
    fn route(
        &self,
        service_method: &str,
        codec: CodecType,
        body: &[u8],
    ) -> Result<BoxFuture<'static, Result<Vec<u8>>>> {
        let (service_name, method_name) = split_service_method(service_method)?;
        let service = self
            .services
            .get(service_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;
        service.invoke(method_name, codec, body)
    }

    /// Snapshot of the registered services, for the debug view.
    pub(crate) fn services(&self) -> Vec<Arc<Service>> {
        let mut services: Vec<_> = self
            .services
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }
}

/// Run one invocation and send its single response.
async fn handle_request<W>(
    invocation: BoxFuture<'static, Result<Vec<u8>>>,
    mut header: Header,
    writer: Arc<Mutex<CodecWriter<W>>>,
    handle_timeout: Duration,
) where
    W: AsyncWrite + Send + Unpin,
{
    let outcome = if handle_timeout.is_zero() {
        Ok(invocation.await)
    } else {
        // On expiry the invocation future is dropped with the timeout,
        // so a late result has nowhere to go and cannot produce a
        // second response.
        tokio::time::timeout(handle_timeout, invocation).await
    };

    match outcome {
        Ok(Ok(reply)) => send_response(&writer, &header, &reply).await,
        Ok(Err(err)) => {
            header.error = err.to_string();
            send_response(&writer, &header, &[]).await;
        }
        Err(_) => {
            header.error = format!(
                "request handle timeout: expect within {:?}",
                handle_timeout
            );
            send_response(&writer, &header, &[]).await;
        }
    }
}

/// Send one response under the connection's write mutex.
///
/// An empty `reply` stands for the unit sentinel accompanying an error
/// header.
async fn send_response<W>(writer: &Arc<Mutex<CodecWriter<W>>>, header: &Header, reply: &[u8])
where
    W: AsyncWrite + Send + Unpin,
{
    let mut writer = writer.lock().await;
    let result = if reply.is_empty() {
        writer.write(header, &()).await
    } else {
        writer.write_raw(header, reply).await
    };
    if let Err(err) = result {
        tracing::error!(error = %err, "rpc server: write response error");
    }
}

fn is_clean_eof(err: &RpcError) -> bool {
    matches!(err, RpcError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{write_options, Options};
    use crate::service::MethodError;
    use serde::{Deserialize, Serialize};
    use tokio::io::AsyncReadExt;

    #[derive(Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    struct Foo;

    fn test_server() -> Arc<Server> {
        let server = Server::new();
        server
            .register(
                Service::builder(Foo)
                    .method("Sum", |_foo, args: Args| async move {
                        Ok(args.num1 + args.num2)
                    })
                    .method("Fail", |_foo, _args: Args| async move {
                        Err::<i32, _>(MethodError::from("always fails"))
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Arc::new(server)
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let server = Server::new();
        server
            .register(Service::builder(Foo).build().unwrap())
            .unwrap();
        let err = server
            .register(Service::builder(Foo).build().unwrap())
            .unwrap_err();
        assert!(matches!(err, RpcError::DuplicateService(_)));
    }

    async fn request(
        writer: &mut CodecWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        seq: u64,
        service_method: &str,
        args: &Args,
    ) {
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        writer.write(&header, args).await.unwrap();
    }

    /// Drive the connection loop directly over an in-memory duplex.
    #[tokio::test]
    async fn request_loop_answers_with_matching_seq() {
        let server = test_server();
        let (client, conn) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move { server.serve_conn(conn).await });

        let (read_half, mut write_half) = tokio::io::split(client);
        write_options(&mut write_half, &Options::default())
            .await
            .unwrap();
        let codec = CodecType::Binary;
        let mut writer = CodecWriter::new(write_half, codec);
        let mut reader = CodecReader::new(read_half, codec);

        request(&mut writer, 1, "Foo.Sum", &Args { num1: 1, num2: 3 }).await;
        request(&mut writer, 2, "Foo.Missing", &Args { num1: 0, num2: 0 }).await;
        request(&mut writer, 3, "Foo.Fail", &Args { num1: 0, num2: 0 }).await;

        let mut seen = 0;
        for _ in 0..3 {
            let header = reader.read_header().await.unwrap();
            let body = reader.read_body().await.unwrap();
            match header.seq {
                1 => {
                    assert!(header.error.is_empty());
                    let sum: i32 = codec.decode(&body).unwrap();
                    assert_eq!(sum, 4);
                }
                2 => assert!(header.error.contains("can't find method Missing")),
                3 => assert_eq!(header.error, "always fails"),
                seq => panic!("unexpected seq {seq}"),
            }
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn wrong_magic_number_closes_the_connection() {
        let server = test_server();
        let (mut client, conn) = tokio::io::duplex(1024);
        let serve = tokio::spawn(async move { server.serve_conn(conn).await });

        let options = Options {
            magic_number: 0xdeadbeef,
            ..Options::default()
        };
        write_options(&mut client, &options).await.unwrap();

        serve.await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_codec_closes_the_connection() {
        let server = test_server();
        let (mut client, conn) = tokio::io::duplex(1024);
        let serve = tokio::spawn(async move { server.serve_conn(conn).await });

        let options = Options {
            codec_type: "application/x-carrier-pigeon".to_string(),
            ..Options::default()
        };
        write_options(&mut client, &options).await.unwrap();

        serve.await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn slow_handler_times_out_with_the_configured_bound() {
        let server = test_server();
        server
            .register(
                Service::builder(())
                    .named("Slow")
                    .method("Nap", |_unit, millis: u64| async move {
                        tokio::time::sleep(Duration::from_millis(millis)).await;
                        Ok(millis)
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let (client, conn) = tokio::io::duplex(16 * 1024);
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve_conn(conn).await });

        let (read_half, mut write_half) = tokio::io::split(client);
        write_options(
            &mut write_half,
            &Options {
                handle_timeout: Duration::from_millis(50),
                ..Options::default()
            },
        )
        .await
        .unwrap();
        let codec = CodecType::Binary;
        let mut writer = CodecWriter::new(write_half, codec);
        let mut reader = CodecReader::new(read_half, codec);

        writer
            .write(&Header::request("Slow.Nap", 1), &500u64)
            .await
            .unwrap();

        let header = reader.read_header().await.unwrap();
        reader.read_body().await.unwrap();
        assert!(header.error.contains("request handle timeout"));
    }
}

//! HTTP CONNECT upgrade: tunneling the RPC stream through an HTTP
//! endpoint, plus a read-only debug page.
//!
//! The exchange is fixed:
//!
//! ```text
//! client: CONNECT /_geerpc_ HTTP/1.0\r\n\r\n
//! server: HTTP/1.0 200 Connected to Gee RPC\r\n\r\n
//! ```
//!
//! after which the connection is the raw RPC stream. Only the request
//! head is HTTP; both sides parse it byte-by-byte so that not a single
//! byte of the RPC stream behind it is swallowed by read-ahead.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::{Result, RpcError};
use crate::server::Server;

/// Path the RPC CONNECT endpoint lives on.
pub const DEFAULT_RPC_PATH: &str = "/_geerpc_";

/// Path of the debug page listing registered services.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/geerpc";

/// Status the server answers a successful CONNECT with. The client
/// compares it verbatim.
const CONNECTED: &str = "200 Connected to Gee RPC";

/// Upper bound on an HTTP request/response head.
const MAX_HEAD: usize = 8 * 1024;

impl Server {
    /// Accept HTTP connections: CONNECTs on [`DEFAULT_RPC_PATH`] become
    /// RPC streams, GETs on [`DEFAULT_DEBUG_PATH`] render the service
    /// table, everything else is told to CONNECT.
    pub async fn accept_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let _ = stream.set_nodelay(true);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.serve_http_conn(stream).await });
                }
                Err(err) => {
                    tracing::error!(error = %err, "rpc server: accept error");
                    return;
                }
            }
        }
    }

    /// Handle one HTTP connection.
    pub async fn serve_http_conn<C>(&self, mut conn: C)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let head = match read_head(&mut conn).await {
            Ok(head) => head,
            Err(err) => {
                tracing::warn!(error = %err, "rpc server: bad http head");
                return;
            }
        };
        let Some((method, path)) = parse_request_line(&head) else {
            tracing::warn!("rpc server: malformed http request line");
            return;
        };

        match (method.as_str(), path.as_str()) {
            ("CONNECT", DEFAULT_RPC_PATH) => {
                let response = format!("HTTP/1.0 {CONNECTED}\r\n\r\n");
                if conn.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                self.serve_conn(conn).await;
            }
            ("GET", DEFAULT_DEBUG_PATH) => {
                let body = self.debug_html();
                let response = format!(
                    "HTTP/1.0 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = conn.write_all(response.as_bytes()).await;
            }
            _ => {
                let _ = conn
                    .write_all(
                        b"HTTP/1.0 405 Method Not Allowed\r\n\
                          Content-Type: text/plain; charset=utf-8\r\n\r\n\
                          405 must CONNECT\n",
                    )
                    .await;
            }
        }
    }

    /// Render the debug page: every service, its methods, and their
    /// call counts.
    fn debug_html(&self) -> String {
        let mut html = String::from(
            "<html><body><title>GeeRPC Services</title>\n",
        );
        for service in self.services() {
            html.push_str(&format!(
                "<hr>Service {}\n<hr>\
                 <table>\n<th align=center>Method</th><th align=center>Calls</th>\n",
                service.name()
            ));
            let mut methods: Vec<_> = service.methods().collect();
            methods.sort_by_key(|(name, _)| *name);
            for (name, desc) in methods {
                html.push_str(&format!(
                    "<tr><td align=left font=fixed>{}({}) -> {}</td><td align=center>{}</td></tr>\n",
                    name,
                    desc.arg_type(),
                    desc.reply_type(),
                    desc.num_calls()
                ));
            }
            html.push_str("</table>\n");
        }
        html.push_str("</body></html>");
        html
    }
}

/// Client half of the CONNECT handshake. On success the connection is
/// ready for the RPC option line.
pub(crate) async fn client_handshake<C>(conn: &mut C, path: &str) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("CONNECT {path} HTTP/1.0\r\n\r\n");
    conn.write_all(request.as_bytes()).await?;

    let head = read_head(conn).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line
        .split_once(' ')
        .map(|(_, status)| status.trim_end())
        .unwrap_or_default();
    if status != CONNECTED {
        return Err(RpcError::Protocol(format!(
            "unexpected HTTP response: {status_line}"
        )));
    }
    Ok(())
}

/// Read an HTTP head up to and including the blank line, one byte at a
/// time so nothing past it is consumed.
async fn read_head<C>(conn: &mut C) -> Result<String>
where
    C: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(128);
    loop {
        head.push(conn.read_u8().await?);
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
        if head.len() > MAX_HEAD {
            return Err(RpcError::Protocol("http head too long".to_string()));
        }
    }
    String::from_utf8(head).map_err(|_| RpcError::Protocol("http head is not utf-8".to_string()))
}

/// First line of a request head as `(method, path)`.
fn parse_request_line(head: &str) -> Option<(String, String)> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    Some((method, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Service;

    struct Foo;

    #[test]
    fn request_line_parses_method_and_path() {
        let head = "CONNECT /_geerpc_ HTTP/1.0\r\n\r\n";
        assert_eq!(
            parse_request_line(head),
            Some(("CONNECT".to_string(), "/_geerpc_".to_string()))
        );
        assert_eq!(parse_request_line("\r\n\r\n"), None);
    }

    #[tokio::test]
    async fn handshake_accepts_the_exact_status() {
        let (mut client, mut fake_server) = tokio::io::duplex(1024);

        let handshake = tokio::spawn(async move {
            client_handshake(&mut client, DEFAULT_RPC_PATH).await.map(|_| client)
        });

        let head = read_head(&mut fake_server).await.unwrap();
        assert!(head.starts_with("CONNECT /_geerpc_ HTTP/1.0"));
        fake_server
            .write_all(b"HTTP/1.0 200 Connected to Gee RPC\r\n\r\n")
            .await
            .unwrap();

        assert!(handshake.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn handshake_rejects_any_other_status() {
        let (mut client, mut fake_server) = tokio::io::duplex(1024);

        let handshake =
            tokio::spawn(async move { client_handshake(&mut client, DEFAULT_RPC_PATH).await });

        read_head(&mut fake_server).await.unwrap();
        fake_server
            .write_all(b"HTTP/1.0 404 Not Found\r\n\r\n")
            .await
            .unwrap();

        let err = handshake.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[tokio::test]
    async fn non_connect_requests_get_405() {
        let server = Arc::new(Server::new());
        let (mut client, conn) = tokio::io::duplex(4096);
        let served = tokio::spawn(async move { server.serve_http_conn(conn).await });

        client
            .write_all(b"POST /_geerpc_ HTTP/1.0\r\n\r\n")
            .await
            .unwrap();

        served.await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.0 405"));
        assert!(response.contains("must CONNECT"));
    }

    #[tokio::test]
    async fn debug_page_lists_services_and_counts() {
        let server = Arc::new(Server::new());
        server
            .register(
                Service::builder(Foo)
                    .method("Noop", |_foo, _: ()| async move { Ok(()) })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let (mut client, conn) = tokio::io::duplex(16 * 1024);
        let served = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve_http_conn(conn).await })
        };

        client
            .write_all(b"GET /debug/geerpc HTTP/1.0\r\n\r\n")
            .await
            .unwrap();

        served.await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.0 200"));
        assert!(response.contains("Service Foo"));
        assert!(response.contains("Noop"));
    }
}

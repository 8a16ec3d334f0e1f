//! Service registry: the in-memory directory of live servers, its HTTP
//! surface, and the heartbeat helper servers use to stay listed.
//!
//! The protocol is two headers on one path:
//!
//! - `GET /_geerpc_/registry` answers with `X-Geerpc-Servers`, a
//!   comma-separated list of every address whose last heartbeat is
//!   within the timeout;
//! - `POST /_geerpc_/registry` with `X-Geerpc-Server: addr` registers
//!   the address or refreshes its timestamp.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
// tokio's Instant: expiry follows the runtime clock.
use tokio::time::Instant;

use crate::error::Result;

/// Path the registry serves on.
pub const DEFAULT_REGISTRY_PATH: &str = "/_geerpc_/registry";

/// How long a server stays listed after its last heartbeat.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Response header carrying the alive list.
const SERVERS_HEADER: HeaderName = HeaderName::from_static("x-geerpc-servers");

/// Request header naming the server being registered or refreshed.
const SERVER_HEADER: &str = "x-geerpc-server";

/// In-memory registry of server addresses and their last heartbeat.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    /// A registry evicting servers `timeout` after their last
    /// heartbeat; zero means [`DEFAULT_TIMEOUT`].
    pub fn new(timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        Self {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `addr`, or refresh its heartbeat timestamp.
    pub fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().unwrap();
        servers.insert(addr.to_string(), Instant::now());
    }

    /// Sorted list of alive addresses; dead entries are pruned on the
    /// way out.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        servers.retain(|_, start| start.elapsed() <= self.timeout);
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// The registry's HTTP surface, mounted on
    /// [`DEFAULT_REGISTRY_PATH`].
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(DEFAULT_REGISTRY_PATH, get(get_servers).post(post_server))
            .with_state(self)
    }

    /// Serve the registry on an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = ?listener.local_addr(), "rpc registry: serving");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

async fn get_servers(State(registry): State<Arc<Registry>>) -> (HeaderMap, StatusCode) {
    let alive = registry.alive_servers().join(",");
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&alive) {
        headers.insert(SERVERS_HEADER, value);
    }
    (headers, StatusCode::OK)
}

async fn post_server(State(registry): State<Arc<Registry>>, headers: HeaderMap) -> StatusCode {
    match headers.get(SERVER_HEADER).and_then(|v| v.to_str().ok()) {
        Some(addr) if !addr.is_empty() => {
            registry.put_server(addr);
            StatusCode::OK
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Keep `addr` registered at `registry_url`.
///
/// The first heartbeat is sent synchronously so a dead registry is
/// reported to the caller; after that a background task posts every
/// `period` (default: one minute short of [`DEFAULT_TIMEOUT`], so the
/// entry is refreshed before it can expire) until a send fails. The
/// returned handle can be aborted to stop heartbeating.
pub async fn heartbeat(
    registry_url: &str,
    addr: &str,
    period: Option<Duration>,
) -> Result<JoinHandle<()>> {
    let period = period.unwrap_or(DEFAULT_TIMEOUT - Duration::from_secs(60));
    let client = reqwest::Client::new();

    send_heartbeat(&client, registry_url, addr).await?;

    let registry_url = registry_url.to_string();
    let addr = addr.to_string();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // interval fires immediately; the synchronous beat above
        // already covered that slot.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = send_heartbeat(&client, &registry_url, &addr).await {
                tracing::error!(error = %err, addr = %addr, "rpc registry: heartbeat failed");
                return;
            }
        }
    });
    Ok(handle)
}

async fn send_heartbeat(client: &reqwest::Client, registry_url: &str, addr: &str) -> Result<()> {
    tracing::debug!(addr, registry_url, "rpc registry: send heartbeat");
    client
        .post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_falls_back_to_the_default() {
        let registry = Registry::new(Duration::ZERO);
        assert_eq!(registry.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn alive_servers_is_sorted() {
        let registry = Registry::default();
        registry.put_server("tcp@b:1");
        registry.put_server("tcp@a:1");
        registry.put_server("tcp@c:1");
        assert_eq!(
            registry.alive_servers(),
            vec!["tcp@a:1", "tcp@b:1", "tcp@c:1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_servers_are_pruned() {
        let registry = Registry::new(Duration::from_secs(1));
        registry.put_server("tcp@stale:1");

        tokio::time::advance(Duration::from_millis(1500)).await;
        registry.put_server("tcp@fresh:1");

        assert_eq!(registry.alive_servers(), vec!["tcp@fresh:1"]);
        // Pruned for good, not just filtered from the reply.
        assert_eq!(registry.servers.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_heartbeat_revives_a_nearly_dead_entry() {
        let registry = Registry::new(Duration::from_secs(1));
        registry.put_server("tcp@a:1");

        tokio::time::advance(Duration::from_millis(900)).await;
        registry.put_server("tcp@a:1");
        tokio::time::advance(Duration::from_millis(900)).await;

        assert_eq!(registry.alive_servers(), vec!["tcp@a:1"]);
    }
}

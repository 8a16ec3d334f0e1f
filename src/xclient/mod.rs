//! Load-balanced multi-server client.
//!
//! [`XClient`] sits on a [`Discovery`] source and a pool of cached
//! per-address [`Client`]s. `call` sends one request to one server
//! picked by the configured [`SelectMode`]; `broadcast` fans a request
//! out to every discovered server, first success winning.

mod discovery;

pub use discovery::{
    Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode, DEFAULT_UPDATE_TIMEOUT,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::codec::CodecType;
use crate::error::{Result, RpcError};
use crate::protocol::Options;

/// Facade over discovery plus a pool of cached clients.
pub struct XClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    options: Options,
    clients: Mutex<HashMap<String, Arc<Client>>>,
    closed: AtomicBool,
}

impl XClient {
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, options: Options) -> Self {
        Self {
            discovery,
            mode,
            options,
            clients: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Call one server, picked by the selection mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let addr = self.discovery.get(self.mode).await?;
        let client = self.cached_client(&addr).await?;
        client.call(service_method, args).await
    }

    /// Call every discovered server concurrently; the first successful
    /// reply wins and cancels the rest. If nothing succeeds, the first
    /// error observed is returned.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let servers = self.discovery.get_all().await?;
        if servers.is_empty() {
            return Err(RpcError::NoAvailableServers);
        }

        // Encode once; every pooled client speaks the same codec.
        let codec = CodecType::from_name(&self.options.codec_type).ok_or_else(|| {
            RpcError::Protocol(format!("invalid codec type {}", self.options.codec_type))
        })?;
        let body = codec.encode(args)?;

        let token = CancellationToken::new();
        // Dropping the broadcast future (the caller's cancellation
        // surface) cancels the whole fan-out with it.
        let _guard = token.clone().drop_guard();
        let (tx, mut rx) = mpsc::channel::<Result<R>>(servers.len());

        for addr in servers {
            let client = self.cached_client(&addr).await;
            let service_method = service_method.to_string();
            let body = body.clone();
            let token = token.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = match client {
                    Ok(client) => {
                        tokio::select! {
                            _ = token.cancelled() => Err(RpcError::Cancelled),
                            outcome = client.call_encoded::<R>(&service_method, body) => outcome,
                        }
                    }
                    Err(err) => Err(err),
                };
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        let mut reply = None;
        let mut first_err = None;
        while let Some(outcome) = rx.recv().await {
            match outcome {
                Ok(value) => {
                    if reply.is_none() {
                        reply = Some(value);
                        // First success locks the reply in and aborts
                        // the stragglers.
                        token.cancel();
                    }
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                        token.cancel();
                    }
                }
            }
        }

        match reply {
            // Any success suppresses earlier errors: one live server
            // masks a dead one.
            Some(value) => Ok(value),
            None => Err(first_err.unwrap_or(RpcError::NoAvailableServers)),
        }
    }

    /// Close every cached client. Further calls fail with
    /// [`RpcError::Shutdown`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
    }

    /// Fetch the cached client for `addr`, evicting and replacing it if
    /// its connection has gone bad. A dial that fails is not cached.
    async fn cached_client(&self, addr: &str) -> Result<Arc<Client>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Shutdown);
        }

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(addr) {
            if client.is_available() {
                return Ok(Arc::clone(client));
            }
            if let Some(stale) = clients.remove(addr) {
                let _ = stale.close().await;
            }
        }

        let client = Arc::new(Client::xdial(addr, self.options.clone()).await?);
        clients.insert(addr.to_string(), Arc::clone(&client));
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calls_after_close_fail() {
        let discovery = Arc::new(MultiServersDiscovery::new(vec!["tcp@127.0.0.1:1".into()]));
        let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

        xclient.close().await;
        let err = xclient.call::<_, i32>("Foo.Sum", &1).await.unwrap_err();
        assert!(matches!(err, RpcError::Shutdown));
    }

    #[tokio::test]
    async fn broadcast_over_nothing_reports_no_servers() {
        let discovery = Arc::new(MultiServersDiscovery::new(Vec::new()));
        let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

        let err = xclient.broadcast::<_, i32>("Foo.Sum", &1).await.unwrap_err();
        assert!(matches!(err, RpcError::NoAvailableServers));
    }
}

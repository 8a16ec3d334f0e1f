//! Server discovery and selection.
//!
//! [`Discovery`] yields the current set of server addresses;
//! [`MultiServersDiscovery`] is a hand-maintained list,
//! [`RegistryDiscovery`] keeps the list fresh from a registry. Both
//! hand out addresses by [`SelectMode`].

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::error::{Result, RpcError};

/// Load-balancing strategy for [`Discovery::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly random pick.
    Random,
    /// Rotate through the list, starting from a random offset.
    RoundRobin,
}

/// Source of the current server list.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-fetch the list from wherever it comes from, if anywhere.
    async fn refresh(&self) -> Result<()>;

    /// Replace the list by hand.
    async fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Pick one address by `mode`.
    async fn get(&self, mode: SelectMode) -> Result<String>;

    /// The whole current list.
    async fn get_all(&self) -> Result<Vec<String>>;
}

struct ServerList {
    servers: Vec<String>,
    /// Round-robin cursor; starts at a random offset so a fleet of
    /// fresh clients does not gang up on the first server.
    index: usize,
    rng: StdRng,
}

/// Discovery over a fixed, caller-provided server list.
pub struct MultiServersDiscovery {
    inner: Mutex<ServerList>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = StdRng::from_entropy();
        let index = rng.gen_range(0..u32::MAX as usize);
        Self {
            inner: Mutex::new(ServerList {
                servers,
                index,
                rng,
            }),
        }
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<()> {
        // Nothing upstream to refresh from.
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.inner.lock().unwrap().servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.servers.len();
        if n == 0 {
            return Err(RpcError::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => {
                let pick = inner.rng.gen_range(0..n);
                Ok(inner.servers[pick].clone())
            }
            SelectMode::RoundRobin => {
                let pick = inner.servers[inner.index % n].clone();
                inner.index = (inner.index + 1) % n;
                Ok(pick)
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().servers.clone())
    }
}

/// How stale the fetched list may get before `refresh` actually goes to
/// the registry again.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery backed by a registry's `GET` endpoint.
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry_url: String,
    update_timeout: Duration,
    http: reqwest::Client,
    /// Also serializes concurrent refreshes; the lock is held across
    /// the fetch.
    last_update: tokio::sync::Mutex<Option<Instant>>,
}

impl RegistryDiscovery {
    /// Discovery polling `registry_url`, going back at most every
    /// `update_timeout` (zero means [`DEFAULT_UPDATE_TIMEOUT`]).
    pub fn new(registry_url: impl Into<String>, update_timeout: Duration) -> Self {
        let update_timeout = if update_timeout.is_zero() {
            DEFAULT_UPDATE_TIMEOUT
        } else {
            update_timeout
        };
        Self {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry_url: registry_url.into(),
            update_timeout,
            http: reqwest::Client::new(),
            last_update: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    /// Fetch the alive list from the registry, unless the cached one is
    /// still within `update_timeout`. A registry that cannot be reached
    /// is an error, not a silent fall-back to stale data.
    async fn refresh(&self) -> Result<()> {
        let mut last_update = self.last_update.lock().await;
        if let Some(at) = *last_update {
            if at.elapsed() < self.update_timeout {
                return Ok(());
            }
        }

        tracing::debug!(url = %self.registry_url, "rpc discovery: refresh from registry");
        let response = self.http.get(&self.registry_url).send().await?;
        let header = response
            .headers()
            .get("x-geerpc-servers")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                RpcError::Registry("response lacks the X-Geerpc-Servers header".to_string())
            })?;

        let servers: Vec<String> = header
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        self.servers.update(servers).await?;
        *last_update = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.servers.update(servers).await?;
        *self.last_update.lock().await = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.servers.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        self.servers.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn three_servers() -> MultiServersDiscovery {
        MultiServersDiscovery::new(vec![
            "tcp@a:1".to_string(),
            "tcp@b:1".to_string(),
            "tcp@c:1".to_string(),
        ])
    }

    #[tokio::test]
    async fn empty_list_is_an_error() {
        let d = MultiServersDiscovery::new(Vec::new());
        for mode in [SelectMode::Random, SelectMode::RoundRobin] {
            assert!(matches!(
                d.get(mode).await,
                Err(RpcError::NoAvailableServers)
            ));
        }
    }

    #[tokio::test]
    async fn round_robin_hits_every_server_once_per_cycle() {
        let d = three_servers();
        let n = d.get_all().await.unwrap().len();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..n {
            *counts.entry(d.get(SelectMode::RoundRobin).await.unwrap()).or_default() += 1;
        }

        assert_eq!(counts.len(), n);
        assert!(counts.values().all(|&c| c == 1));
    }

    #[tokio::test]
    async fn random_selection_stays_in_the_set() {
        let d = three_servers();
        let all = d.get_all().await.unwrap();
        for _ in 0..32 {
            let pick = d.get(SelectMode::Random).await.unwrap();
            assert!(all.contains(&pick));
        }
    }

    #[tokio::test]
    async fn update_replaces_the_list() {
        let d = three_servers();
        d.update(vec!["tcp@z:9".to_string()]).await.unwrap();
        assert_eq!(d.get_all().await.unwrap(), vec!["tcp@z:9"]);
        assert_eq!(d.get(SelectMode::RoundRobin).await.unwrap(), "tcp@z:9");
    }

    #[tokio::test]
    async fn registry_discovery_serves_cached_list_within_the_window() {
        // The URL is unreachable; within the update window that must
        // not matter.
        let d = RegistryDiscovery::new("http://127.0.0.1:1/none", Duration::from_secs(3600));
        d.update(vec!["tcp@cached:1".to_string()]).await.unwrap();

        assert_eq!(d.get_all().await.unwrap(), vec!["tcp@cached:1"]);
    }

    #[tokio::test]
    async fn registry_discovery_surfaces_fetch_errors() {
        let d = RegistryDiscovery::new("http://127.0.0.1:1/none", Duration::from_millis(1));
        assert!(d.refresh().await.is_err());
    }
}

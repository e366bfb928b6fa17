//! Connection pool for the configured backend set

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};

/// Named backend channels, established on demand and cached.
///
/// Cheap to clone; every call to the same backend shares one HTTP/2
/// connection, with streams multiplexed on top of it.
#[derive(Clone)]
pub struct BackendPool {
    // Resolved once at startup from configuration, immutable afterwards.
    endpoints: Arc<HashMap<String, String>>,

    // Lock-free concurrent hashmap: backend name -> live channel
    connections: Arc<DashMap<String, Channel>>,

    connect_timeout: Duration,
    tcp_keepalive: Duration,
    http2_keepalive_interval: Duration,
}

impl BackendPool {
    pub fn new(config: &ProxyConfig) -> Self {
        let endpoints = config
            .backends
            .iter()
            .map(|b| (b.name.clone(), b.endpoint.clone()))
            .collect();

        Self {
            endpoints: Arc::new(endpoints),
            connections: Arc::new(DashMap::new()),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            tcp_keepalive: Duration::from_secs(config.tcp_keepalive_secs),
            http2_keepalive_interval: Duration::from_secs(config.http2_keepalive_interval_secs),
        }
    }

    /// Get or create the channel for a backend (lock-free read, minimal
    /// locking for write).
    ///
    /// Uses the DashMap entry() API so two concurrent calls never dial the
    /// same backend twice.
    pub async fn get(&self, name: &str) -> ProxyResult<Channel> {
        // Fast path: channel already exists
        if let Some(channel) = self.connections.get(name) {
            return Ok(channel.clone());
        }

        match self.connections.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok(entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let channel = self.connect(name).await?;
                entry.insert(channel.clone());
                Ok(channel)
            }
        }
    }

    async fn connect(&self, name: &str) -> ProxyResult<Channel> {
        let uri = self
            .endpoints
            .get(name)
            .ok_or_else(|| ProxyError::BackendUnavailable {
                backend: name.to_string(),
                reason: "not configured".to_string(),
            })?;

        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| ProxyError::BackendUnavailable {
                backend: name.to_string(),
                reason: format!("invalid endpoint: {e}"),
            })?
            .tcp_keepalive(Some(self.tcp_keepalive))
            .http2_keep_alive_interval(self.http2_keepalive_interval)
            .keep_alive_timeout(Duration::from_secs(10))
            .connect_timeout(self.connect_timeout);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ProxyError::BackendUnavailable {
                backend: name.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(backend = name, endpoint = %uri, "Connected to backend");

        Ok(channel)
    }

    /// Number of live channels
    pub fn connected(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn pool_with(backends: Vec<BackendConfig>) -> BackendPool {
        let config = ProxyConfig {
            backends,
            ..Default::default()
        };
        BackendPool::new(&config)
    }

    #[tokio::test]
    async fn test_get_unknown_backend() {
        let pool = pool_with(vec![]);
        let err = pool.get("missing").await.unwrap_err();
        assert!(matches!(err, ProxyError::BackendUnavailable { .. }));
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn test_get_unreachable_backend() {
        // Port 1 is essentially never listening locally.
        let pool = pool_with(vec![BackendConfig {
            name: "dead".to_string(),
            endpoint: "http://127.0.0.1:1".to_string(),
        }]);

        let err = pool.get("dead").await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::BackendUnavailable { ref backend, .. } if backend == "dead"
        ));
        assert_eq!(pool.connected(), 0);
    }

    #[tokio::test]
    async fn test_pool_starts_empty() {
        let pool = pool_with(vec![BackendConfig {
            name: "shard-a".to_string(),
            endpoint: "http://127.0.0.1:8051".to_string(),
        }]);
        assert_eq!(pool.connected(), 0);
    }
}

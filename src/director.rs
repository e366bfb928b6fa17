//! Stream director - routing policy mapping inbound calls to backends

use std::time::Duration;

use async_trait::async_trait;
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::transport::Channel;

use crate::config::{ProxyConfig, RouteRule};
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::pool::BackendPool;

/// One backend destination selected for a call.
#[derive(Clone, Debug)]
pub struct RouteTarget {
    pub name: String,
    pub channel: Channel,
}

/// The director's output: the outgoing call context plus the ordered set of
/// backend connections the call fans out to.
#[derive(Debug)]
pub struct Route {
    pub metadata: MetadataMap,
    pub timeout: Option<Duration>,
    pub backends: Vec<RouteTarget>,
}

/// Routing policy consumed by the proxy handler.
///
/// Implementations may route by method prefix, by metadata inspection, by
/// static configuration or by service discovery; the handler only cares
/// about the returned route. A `RoutingNotFound` error is a normal outcome
/// and surfaces to the caller as an unimplemented-method status.
#[async_trait]
pub trait StreamDirector: Send + Sync + 'static {
    async fn route(&self, inbound: &MetadataMap, full_method: &str) -> ProxyResult<Route>;
}

/// Transport-level keys that must not leak from the inbound call into the
/// outbound one; the proxy negotiates these per hop itself.
const RESERVED_KEYS: &[&str] = &[
    "te",
    "host",
    "connection",
    "content-type",
    "content-length",
    "user-agent",
    "accept-encoding",
    "grpc-encoding",
    "grpc-accept-encoding",
];

/// Copy inbound metadata into a fresh outbound map, dropping reserved
/// transport keys. The copy is defensive: nothing a backend does to the
/// outbound map can reach the inbound one.
pub fn copy_metadata(inbound: &MetadataMap) -> MetadataMap {
    let mut outbound = MetadataMap::new();
    for entry in inbound.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                if !RESERVED_KEYS.contains(&key.as_str()) {
                    outbound.append(key.clone(), value.clone());
                }
            }
            KeyAndValueRef::Binary(key, value) => {
                outbound.append_bin(key.clone(), value.clone());
            }
        }
    }
    outbound
}

/// Configuration-driven director: method-prefix rules resolved once at
/// startup. An empty rule set broadcasts every call to every configured
/// backend - the fan-out sample policy.
pub struct TableDirector {
    pool: BackendPool,
    rules: Vec<RouteRule>,
    all_backends: Vec<String>,
    forward_timeout: Option<Duration>,
}

impl TableDirector {
    pub fn new(config: &ProxyConfig, pool: BackendPool) -> Self {
        Self {
            pool,
            rules: config.routes.clone(),
            all_backends: config.backends.iter().map(|b| b.name.clone()).collect(),
            forward_timeout: config.forward_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Select the backend names for a method, first matching rule wins.
    fn select(&self, full_method: &str) -> Option<&[String]> {
        if self.rules.is_empty() {
            return Some(&self.all_backends);
        }
        self.rules
            .iter()
            .find(|rule| full_method.starts_with(&rule.method_prefix))
            .map(|rule| rule.backends.as_slice())
    }
}

#[async_trait]
impl StreamDirector for TableDirector {
    async fn route(&self, inbound: &MetadataMap, full_method: &str) -> ProxyResult<Route> {
        let Some(selected) = self.select(full_method) else {
            return Err(ProxyError::RoutingNotFound {
                method: full_method.to_string(),
            });
        };
        if selected.is_empty() {
            return Err(ProxyError::InvalidRoute {
                method: full_method.to_string(),
            });
        }

        let mut metadata = copy_metadata(inbound);
        if self.forward_timeout.is_some() {
            // The director's deadline replaces whatever the caller asked for.
            metadata.remove("grpc-timeout");
        }

        let mut backends = Vec::with_capacity(selected.len());
        for name in selected {
            let channel = self.pool.get(name).await?;
            backends.push(RouteTarget {
                name: name.clone(),
                channel,
            });
        }

        tracing::debug!(
            method = full_method,
            backends = backends.len(),
            "Route resolved"
        );

        Ok(Route {
            metadata,
            timeout: self.forward_timeout,
            backends,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn test_config(routes: Vec<RouteRule>) -> ProxyConfig {
        ProxyConfig {
            backends: vec![
                BackendConfig {
                    name: "shard-a".to_string(),
                    endpoint: "http://127.0.0.1:1".to_string(),
                },
                BackendConfig {
                    name: "shard-b".to_string(),
                    endpoint: "http://127.0.0.1:1".to_string(),
                },
            ],
            routes,
            ..Default::default()
        }
    }

    fn director(routes: Vec<RouteRule>) -> TableDirector {
        let config = test_config(routes);
        let pool = BackendPool::new(&config);
        TableDirector::new(&config, pool)
    }

    #[test]
    fn test_empty_rules_select_all_backends() {
        let d = director(vec![]);
        let selected = d.select("/machine.Machine/Version").unwrap();
        assert_eq!(selected.to_vec(), vec!["shard-a", "shard-b"]);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let d = director(vec![
            RouteRule {
                method_prefix: "/machine.Machine/".to_string(),
                backends: vec!["shard-a".to_string()],
            },
            RouteRule {
                method_prefix: "/".to_string(),
                backends: vec!["shard-b".to_string()],
            },
        ]);
        assert_eq!(
            d.select("/machine.Machine/Version").unwrap().to_vec(),
            vec!["shard-a"]
        );
        assert_eq!(d.select("/other.Svc/Call").unwrap().to_vec(), vec!["shard-b"]);
    }

    #[tokio::test]
    async fn test_no_matching_rule_is_routing_not_found() {
        // The pool endpoints are unreachable on purpose: a routing miss must
        // be decided before any backend is dialed.
        let d = director(vec![RouteRule {
            method_prefix: "/machine.Machine/".to_string(),
            backends: vec!["shard-a".to_string()],
        }]);

        let err = d
            .route(&MetadataMap::new(), "/unknown.Svc/Call")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::RoutingNotFound { .. }));
    }

    #[test]
    fn test_copy_metadata_keeps_user_keys() {
        let mut inbound = MetadataMap::new();
        inbound.insert("authorization", "bearer token".parse().unwrap());
        inbound.insert("x-request-id", "abc-123".parse().unwrap());
        inbound.append_bin(
            "trace-bin",
            tonic::metadata::MetadataValue::from_bytes(b"\x01\x02"),
        );

        let outbound = copy_metadata(&inbound);
        assert_eq!(outbound.get("authorization").unwrap(), "bearer token");
        assert_eq!(outbound.get("x-request-id").unwrap(), "abc-123");
        assert!(outbound.get_bin("trace-bin").is_some());
    }

    #[test]
    fn test_copy_metadata_strips_reserved_keys() {
        let mut inbound = MetadataMap::new();
        inbound.insert("te", "trailers".parse().unwrap());
        inbound.insert("content-type", "application/grpc".parse().unwrap());
        inbound.insert("grpc-accept-encoding", "gzip".parse().unwrap());
        inbound.insert("x-tenant", "blue".parse().unwrap());

        let outbound = copy_metadata(&inbound);
        assert!(outbound.get("te").is_none());
        assert!(outbound.get("content-type").is_none());
        assert!(outbound.get("grpc-accept-encoding").is_none());
        assert_eq!(outbound.get("x-tenant").unwrap(), "blue");
    }

    #[test]
    fn test_copy_metadata_is_independent_of_inbound() {
        let mut inbound = MetadataMap::new();
        inbound.insert("x-tenant", "blue".parse().unwrap());

        let mut outbound = copy_metadata(&inbound);
        outbound.insert("x-tenant", "green".parse().unwrap());

        assert_eq!(inbound.get("x-tenant").unwrap(), "blue");
    }

    #[test]
    fn test_caller_deadline_propagates_without_director_timeout() {
        let mut inbound = MetadataMap::new();
        inbound.insert("grpc-timeout", "5S".parse().unwrap());

        let outbound = copy_metadata(&inbound);
        assert_eq!(outbound.get("grpc-timeout").unwrap(), "5S");
    }
}

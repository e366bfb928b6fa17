//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Top-level proxy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_port: u16,

    /// Prometheus scrape endpoint; disabled when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,

    pub connect_timeout_secs: u64,
    pub tcp_keepalive_secs: u64,
    pub http2_keepalive_interval_secs: u64,

    /// Deadline applied to every forwarded call. When absent, the caller's
    /// own grpc-timeout is propagated untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_timeout_secs: Option<u64>,

    /// Request-lane buffer between the broadcast pipeline and each backend
    /// stream.
    pub backend_send_buffer: usize,

    /// The fixed backend set this proxy fans out to.
    pub backends: Vec<BackendConfig>,

    /// Method-prefix routing rules, first match wins. An empty list routes
    /// every call to every configured backend.
    pub routes: Vec<RouteRule>,

    /// Explicitly registered services. An empty list registers the proxy as
    /// the fallback for any method (transparent mode).
    pub expose: Vec<ExposedService>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            metrics_port: None,
            connect_timeout_secs: default_connect_timeout(),
            tcp_keepalive_secs: default_tcp_keepalive(),
            http2_keepalive_interval_secs: default_http2_keepalive_interval(),
            forward_timeout_secs: None,
            backend_send_buffer: default_backend_send_buffer(),
            backends: Vec::new(),
            routes: Vec::new(),
            expose: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("GRPC_FANOUT_LISTEN_PORT") {
            config.listen_port = port
                .parse()
                .context("Invalid GRPC_FANOUT_LISTEN_PORT value")?;
        }
        if let Ok(port) = std::env::var("GRPC_FANOUT_METRICS_PORT") {
            config.metrics_port = Some(
                port.parse()
                    .context("Invalid GRPC_FANOUT_METRICS_PORT value")?,
            );
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_port < 1024 {
            anyhow::bail!("Listen port must be >= 1024 (got {})", self.listen_port);
        }

        if self.backends.is_empty() {
            anyhow::bail!("At least one backend must be configured");
        }

        if self.backend_send_buffer == 0 {
            anyhow::bail!("backend_send_buffer must be > 0");
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                anyhow::bail!("Backend name cannot be empty");
            }
            if !names.insert(&backend.name) {
                anyhow::bail!("Duplicate backend name: {}", backend.name);
            }
            backend
                .endpoint
                .parse::<http::Uri>()
                .with_context(|| format!("Invalid endpoint for backend '{}'", backend.name))?;
        }

        for rule in &self.routes {
            if !rule.method_prefix.starts_with('/') {
                anyhow::bail!(
                    "Route prefix '{}' must start with '/'",
                    rule.method_prefix
                );
            }
            if rule.backends.is_empty() {
                anyhow::bail!(
                    "Route '{}' must name at least one backend",
                    rule.method_prefix
                );
            }
            for name in &rule.backends {
                if !names.contains(name) {
                    anyhow::bail!(
                        "Route '{}' references unknown backend '{}'",
                        rule.method_prefix,
                        name
                    );
                }
            }
        }

        for exposed in &self.expose {
            if exposed.service.is_empty() {
                anyhow::bail!("Exposed service name cannot be empty");
            }
            if exposed.methods.is_empty() {
                anyhow::bail!(
                    "Exposed service '{}' must list at least one method",
                    exposed.service
                );
            }
        }

        Ok(())
    }
}

/// One backend connection the proxy may fan out to
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    pub name: String,

    /// Endpoint URI, e.g. `http://127.0.0.1:8051`
    pub endpoint: String,
}

/// One method-prefix routing rule
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RouteRule {
    /// Matched against the fully qualified method, e.g. `/machine.Machine/`
    pub method_prefix: String,

    /// Names of the backends this rule fans out to, in order
    pub backends: Vec<String>,
}

/// One explicitly registered proxied service
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ExposedService {
    pub service: String,
    pub methods: Vec<String>,
}

// Default functions
fn default_listen_port() -> u16 {
    8080
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_tcp_keepalive() -> u64 {
    60
}
fn default_http2_keepalive_interval() -> u64 {
    30
}
fn default_backend_send_buffer() -> usize {
    16
}

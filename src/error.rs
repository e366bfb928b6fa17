//! Call-scoped proxy errors and their gRPC status mapping

use thiserror::Error;
use tonic::{Code, Status};

/// Errors raised while routing or relaying a single call.
///
/// Every variant is scoped to one inbound call; none are fatal to the
/// process. No retries happen here - retry policy belongs to the director
/// or to the caller.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The director found no applicable route for the method.
    #[error("no route for method {method}")]
    RoutingNotFound { method: String },

    /// The director produced a route with zero backends.
    #[error("director returned an empty route for method {method}")]
    InvalidRoute { method: String },

    /// Opening or writing to a backend stream failed.
    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The broadcast pipeline could not read from the caller.
    #[error("failed receiving from downstream: {0}")]
    DownstreamReceive(String),

    /// The fan-in pipeline could not write the merged reply.
    #[error("failed sending merged reply downstream: {0}")]
    DownstreamSend(String),
}

impl From<ProxyError> for Status {
    fn from(err: ProxyError) -> Self {
        let code = match &err {
            ProxyError::RoutingNotFound { .. } | ProxyError::InvalidRoute { .. } => {
                Code::Unimplemented
            }
            ProxyError::BackendUnavailable { .. } => Code::Unavailable,
            ProxyError::DownstreamReceive(_) | ProxyError::DownstreamSend(_) => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_not_found_maps_to_unimplemented() {
        let status = Status::from(ProxyError::RoutingNotFound {
            method: "/pkg.Svc/Method".to_string(),
        });
        assert_eq!(status.code(), Code::Unimplemented);
        assert!(status.message().contains("/pkg.Svc/Method"));
    }

    #[test]
    fn empty_route_maps_to_unimplemented() {
        let status = Status::from(ProxyError::InvalidRoute {
            method: "/pkg.Svc/Method".to_string(),
        });
        assert_eq!(status.code(), Code::Unimplemented);
    }

    #[test]
    fn backend_unavailable_maps_to_unavailable() {
        let status = Status::from(ProxyError::BackendUnavailable {
            backend: "shard-a".to_string(),
            reason: "connection refused".to_string(),
        });
        assert_eq!(status.code(), Code::Unavailable);
        assert!(status.message().contains("shard-a"));
        assert!(status.message().contains("connection refused"));
    }

    #[test]
    fn pipeline_failures_map_to_internal() {
        let recv = Status::from(ProxyError::DownstreamReceive("reset".to_string()));
        assert_eq!(recv.code(), Code::Internal);

        let send = Status::from(ProxyError::DownstreamSend("closed".to_string()));
        assert_eq!(send.code(), Code::Internal);
    }
}

//! grpc-fanout - schema-agnostic gRPC reverse proxy
//!
//! Accepts inbound gRPC streams without knowing the schema of the messages
//! they carry, routes each call to one or more backends by method name and
//! metadata, and relays payloads bidirectionally without deserializing them.
//! A single inbound call can fan out to several backends, with every reply
//! merged into a single response for the caller.

pub mod codec;
pub mod config;
pub mod director;
pub mod error;
pub mod metrics;
pub mod proxy;

pub use codec::{Frame, RawCodec};
pub use config::{BackendConfig, ExposedService, ProxyConfig, RouteRule};
pub use director::{Route, RouteTarget, StreamDirector, TableDirector, copy_metadata};
pub use error::{ProxyError, ProxyResult};
pub use proxy::handler::ProxyService;
pub use proxy::pool::BackendPool;
pub use proxy::stream::SharedDownstream;

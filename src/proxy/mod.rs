//! Proxying engine: per-call orchestration, backend pool, downstream
//! synchronization and service registration.
//!
//! The engine forwards calls it cannot decode: the server is mounted with
//! the raw pass-through codec, the director picks the backend set, and two
//! concurrent pipelines relay frames in both directions for each call.

pub mod handler;
pub mod pool;
pub mod server;
pub mod stream;

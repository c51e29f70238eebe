//! Connections, the location cache and retry policy.
//!
//! This module provides:
//! - Authenticated kernel connections with line and blob primitives
//! - The shared instance/connection cache
//! - Lazy connect and forced reconnect per peer
//! - Bounded retry

mod connection;
mod manager;
mod registry;
mod retry;

pub use connection::{is_failure_line, Connection, ConnectionState, Endpoint, Peer, Transport};
pub use manager::{ConnectionGuard, ConnectionManager};
pub use registry::{ConnectionLease, ConnectionSlot, LocationCache};
pub use retry::{retry_async, RetryConfig, RetryStats};

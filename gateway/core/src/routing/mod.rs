//! Model Routing
//!
//! Routing infrastructure that maps model ids to backends and bounds access
//! to stateful inference connections.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |    Dispatcher    |  <-- Entry point: model id -> backend
//! +--------+---------+
//!          |
//!    +-----+------+------------+
//!    |            |            |
//!    v            v            v
//! +------+   +-------+   +----------+
//! | Echo |   | Proxy |   |  Pooled  |
//! +------+   +-------+   +----+-----+
//!                             |
//!                             v
//!                    +------------------+
//!                    |  ConnectionPool  |  <-- LIFO, fail-fast
//!                    +------------------+
//! ```
//!
//! The dispatcher table is built once at startup and read concurrently
//! afterwards without locking.

pub mod config;
pub mod connection_pool;
mod dispatcher;

pub use config::{BackendConfig, PooledConfig, ProxyConfig};
pub use connection_pool::{ConnectionId, ConnectionPool, Lease, PoolError, PoolStats, PooledConnection};
pub use dispatcher::{DispatchError, Dispatcher, ModelEntry};

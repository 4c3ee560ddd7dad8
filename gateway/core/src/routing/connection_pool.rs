//! Connection Pool Management
//!
//! Bounded pool of stateful inference-client connections with:
//! - A fixed capacity set at construction
//! - LIFO reuse of idle connections (the most recently released is the
//!   warmest)
//! - Fail-fast admission: `acquire` never waits for capacity
//! - RAII leases that return the connection on every exit path
//!
//! # Design
//!
//! All state lives behind a single mutex that is never held across an
//! `.await`, so `acquire` and `release` are atomic with respect to each other
//! and cheap enough to call from async code. Connections are built lazily
//! through a [`ClientFactory`]; building must not perform I/O, the session
//! setup happens later in the backend's generation flow.
//!
//! Released connections are re-admitted without any health check, and idle
//! connections are never evicted.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::inference::ClientFactory;

// ============================================================================
// Connection Pool Types
// ============================================================================

/// Statistics for a connection pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Fixed capacity
    pub capacity: usize,
    /// Connections waiting in the pool
    pub idle_connections: usize,
    /// Connections currently leased
    pub checked_out: usize,
    /// Total connections ever created
    pub connections_created: u64,
}

/// Stable identity of a pooled connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Numeric value of the id
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection owned by the pool
#[derive(Debug)]
pub struct PooledConnection<C> {
    id: ConnectionId,
    client: C,
    initialized: bool,
    created_at: Instant,
    requests_handled: u64,
}

impl<C> PooledConnection<C> {
    fn new(id: ConnectionId, client: C) -> Self {
        Self {
            id,
            client,
            initialized: false,
            created_at: Instant::now(),
            requests_handled: 0,
        }
    }

    /// Connection identity
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Shared access to the client
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Exclusive access to the client
    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// Whether the one-time session setup has been done
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Record that session setup succeeded
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    /// When the connection was created
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Number of times this connection has been leased
    #[must_use]
    pub fn requests_handled(&self) -> u64 {
        self.requests_handled
    }
}

/// Pool errors
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// Every connection is checked out and capacity is reached
    Exhausted {
        /// Capacity of the pool
        capacity: usize,
    },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { capacity } => {
                write!(f, "Connection pool exhausted ({capacity} in use)")
            }
        }
    }
}

impl std::error::Error for PoolError {}

// ============================================================================
// Connection Pool
// ============================================================================

struct PoolState<C> {
    idle: Vec<PooledConnection<C>>,
    checked_out: usize,
    next_id: u64,
}

struct PoolInner<C> {
    name: String,
    capacity: usize,
    factory: Box<dyn ClientFactory<C>>,
    state: Mutex<PoolState<C>>,
}

/// A bounded pool of connections of type `C`
pub struct ConnectionPool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + 'static> ConnectionPool<C> {
    /// Create an empty pool. `name` is only used in logs.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        factory: impl ClientFactory<C> + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                capacity,
                factory: Box::new(factory),
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(capacity),
                    checked_out: 0,
                    next_id: 0,
                }),
            }),
        }
    }

    /// Fixed capacity of the pool
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Current pool statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            capacity: self.inner.capacity,
            idle_connections: state.idle.len(),
            checked_out: state.checked_out,
            connections_created: state.next_id,
        }
    }

    /// Lease a connection.
    ///
    /// Reuses the most recently released idle connection, otherwise creates a
    /// new one if under capacity, otherwise fails immediately with
    /// [`PoolError::Exhausted`].
    pub fn acquire(&self) -> Result<Lease<C>, PoolError> {
        let mut state = self.inner.state.lock();

        let mut connection = if let Some(conn) = state.idle.pop() {
            debug!(
                pool = %self.inner.name,
                connection_id = %conn.id(),
                requests = conn.requests_handled(),
                age_ms = conn.created_at().elapsed().as_millis() as u64,
                "Reusing connection from pool"
            );
            conn
        } else if state.checked_out < self.inner.capacity {
            let id = ConnectionId(state.next_id);
            state.next_id += 1;
            debug!(pool = %self.inner.name, connection_id = %id, "Creating new connection");
            PooledConnection::new(id, self.inner.factory.create())
        } else {
            debug!(pool = %self.inner.name, capacity = self.inner.capacity, "Connection pool exhausted");
            return Err(PoolError::Exhausted {
                capacity: self.inner.capacity,
            });
        };

        state.checked_out += 1;
        connection.requests_handled += 1;

        Ok(Lease {
            connection: Some(connection),
            pool: self.clone(),
        })
    }

    /// Return a leased connection to the idle set.
    ///
    /// The connection is re-admitted unconditionally, even if its last use
    /// failed.
    pub fn release(&self, connection: PooledConnection<C>) {
        let mut state = self.inner.state.lock();

        if state.checked_out == 0 {
            warn!(
                pool = %self.inner.name,
                connection_id = %connection.id,
                "Release without matching acquire, dropping connection"
            );
            return;
        }

        state.checked_out -= 1;
        debug!(
            pool = %self.inner.name,
            connection_id = %connection.id(),
            requests = connection.requests_handled(),
            age_ms = connection.created_at().elapsed().as_millis() as u64,
            "Returned connection to pool"
        );
        state.idle.push(connection);
    }
}

impl<C> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

/// A connection borrowed from the pool (RAII guard)
///
/// Dropping the lease releases the connection, whichever way the owning code
/// exits.
pub struct Lease<C: Send + 'static> {
    connection: Option<PooledConnection<C>>,
    pool: ConnectionPool<C>,
}

impl<C: Send + 'static> Lease<C> {
    /// The leased connection
    pub fn connection(&self) -> &PooledConnection<C> {
        self.connection
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease holds its connection until drop"))
    }

    /// Mutable access to the leased connection
    pub fn connection_mut(&mut self) -> &mut PooledConnection<C> {
        self.connection
            .as_mut()
            .unwrap_or_else(|| unreachable!("lease holds its connection until drop"))
    }

    /// Id of the leased connection
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.connection().id()
    }

    /// Take the connection out of the lease without releasing it.
    ///
    /// The caller becomes responsible for handing it to
    /// [`ConnectionPool::release`].
    #[must_use]
    pub fn into_connection(mut self) -> PooledConnection<C> {
        self.connection
            .take()
            .unwrap_or_else(|| unreachable!("lease holds its connection until drop"))
    }
}

impl<C: Send + 'static> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

impl<C: Send + 'static> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("connection_id", &self.connection.as_ref().map(|c| c.id))
            .field("pool", &self.pool)
            .finish()
    }
}

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::secret::ConnectionSecret;

/// FIFO of handshake-completed agent connections awaiting pairing.
/// A connection lives in at most one pool and leaves it before being bridged.
pub struct ConnectionPool {
    conns: Mutex<VecDeque<TcpStream>>,
}

impl ConnectionPool {
    fn new() -> Self {
        Self {
            conns: Mutex::new(VecDeque::new()),
        }
    }

    /// Append at the tail. Never blocks on I/O while holding the lock.
    pub async fn add(&self, conn: TcpStream) {
        self.conns.lock().await.push_back(conn);
    }

    /// Remove and return the head, or `None` if the pool is empty.
    pub async fn take(&self) -> Option<TcpStream> {
        self.conns.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.conns.lock().await.len()
    }
}

/// Per-secret idle pools on the relay.
pub struct AgentConnections {
    pools: DashMap<ConnectionSecret, Arc<ConnectionPool>>,
}

impl AgentConnections {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    /// File a handshake-completed agent connection into the pool for `secret`,
    /// creating the pool on first use.
    pub async fn add_connection(&self, secret: ConnectionSecret, conn: TcpStream) {
        let pool = self
            .pools
            .entry(secret)
            .or_insert_with(|| Arc::new(ConnectionPool::new()))
            .clone();
        pool.add(conn).await;
    }

    /// Take the oldest idle connection for `secret`, transferring ownership
    /// to the caller. `None` when no pool exists or the pool is empty.
    pub async fn take_connection(&self, secret: &ConnectionSecret) -> Option<TcpStream> {
        let pool = self.pools.get(secret)?.clone();
        pool.take().await
    }

    /// (number of pools, total idle connections) for checkpoint reporting.
    pub async fn stats(&self) -> (usize, usize) {
        let pools: Vec<Arc<ConnectionPool>> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        let mut idle = 0;
        for pool in &pools {
            idle += pool.len().await;
        }
        (pools.len(), idle)
    }
}

impl Default for AgentConnections {
    fn default() -> Self {
        Self::new()
    }
}

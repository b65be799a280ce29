//! # Connection Pool
//!
//! Purpose: Reuse node connections across requests to avoid repeated TCP and
//! TLS handshakes.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: One bounded set of reusable connections per node.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Fail Fast**: Exceeding the per-node limit returns an error immediately.
//! 4. **Explicit Return**: Only `finish` puts a connection back; dropping a
//!    checked-out connection closes it.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tkv_common::{ClientError, ClientResult};
use tracing::debug;

use crate::cluster::Node;
use crate::connection::Connection;
use crate::policy::ClientPolicy;
use crate::tls::TlsConnector;

#[derive(Default)]
struct NodeState {
    idle: VecDeque<Connection>,
    total: usize,
}

struct PoolInner {
    connect_timeout: Duration,
    max_socket_idle: Duration,
    max_conns_per_node: usize,
    tls: Option<TlsConnector>,
    nodes: Mutex<HashMap<String, NodeState>>,
}

/// Connection pool handle shared by every request of a client.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool. `tls` is required when nodes speak TLS.
    pub fn new(policy: &ClientPolicy, tls: Option<TlsConnector>) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                connect_timeout: policy.connect_timeout,
                max_socket_idle: policy.max_socket_idle,
                max_conns_per_node: policy.max_conns_per_node,
                tls,
                nodes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Checks out a connection to `node`, opening one if no valid idle
    /// connection exists.
    pub fn acquire(&self, node: &Node) -> ClientResult<PooledConnection> {
        if let Some(conn) = self.pop_idle(node.name()) {
            return Ok(PooledConnection::new(self.inner.clone(), node.name(), conn));
        }

        if !self.try_reserve(node.name()) {
            return Err(ClientError::PoolExhausted);
        }

        match self.open(node) {
            Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), node.name(), conn)),
            Err(err) => {
                self.inner.release_slot(node.name());
                Err(err)
            }
        }
    }

    /// Closes every idle connection. Checked-out connections are unaffected.
    pub fn clear(&self) {
        let drained: Vec<Connection> = {
            let mut nodes = self.inner.nodes.lock();
            nodes
                .values_mut()
                .flat_map(|state| {
                    state.total = state.total.saturating_sub(state.idle.len());
                    state.idle.drain(..).collect::<Vec<_>>()
                })
                .collect()
        };
        for mut conn in drained {
            conn.close();
        }
    }

    /// Idle connections currently held for `node`.
    pub fn idle_count(&self, node: &str) -> usize {
        self.inner.nodes.lock().get(node).map_or(0, |state| state.idle.len())
    }

    /// Idle plus checked-out connections for `node`.
    pub fn total_count(&self, node: &str) -> usize {
        self.inner.nodes.lock().get(node).map_or(0, |state| state.total)
    }

    fn open(&self, node: &Node) -> ClientResult<Connection> {
        let inner = &self.inner;
        match &inner.tls {
            Some(connector) => Connection::connect_tls(
                node.address(),
                connector,
                node.tls_name(),
                inner.connect_timeout,
                inner.max_socket_idle,
            ),
            None => Connection::connect(node.address(), inner.connect_timeout, inner.max_socket_idle),
        }
    }

    fn pop_idle(&self, node: &str) -> Option<Connection> {
        let mut stale = Vec::new();
        let found = {
            let mut nodes = self.inner.nodes.lock();
            let state = nodes.get_mut(node)?;
            let mut found = None;
            while let Some(conn) = state.idle.pop_front() {
                if conn.is_valid() {
                    found = Some(conn);
                    break;
                }
                state.total = state.total.saturating_sub(1);
                stale.push(conn);
            }
            found
        };

        // Sockets are closed outside the lock.
        if !stale.is_empty() {
            debug!(node, evicted = stale.len(), "evicted idle connections");
        }
        for mut conn in stale {
            conn.close();
        }
        found
    }

    fn try_reserve(&self, node: &str) -> bool {
        let mut nodes = self.inner.nodes.lock();
        let state = nodes.entry(node.to_string()).or_default();
        if state.total >= self.inner.max_conns_per_node {
            return false;
        }
        state.total += 1;
        true
    }
}

impl PoolInner {
    fn release_slot(&self, node: &str) {
        if let Some(state) = self.nodes.lock().get_mut(node) {
            state.total = state.total.saturating_sub(1);
        }
    }

    fn return_connection(&self, node: &str, conn: Connection) {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(node) {
            Some(state) => state.idle.push_back(conn),
            None => drop(conn),
        }
    }
}

/// A checked-out connection.
///
/// Call `finish` after a request completes cleanly to return it to the pool.
/// Dropping it instead closes the socket and frees the slot.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    node: String,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, node: &str, conn: Connection) -> Self {
        PooledConnection {
            pool,
            node: node.to_string(),
            conn: Some(conn),
        }
    }

    /// Returns the connection to the pool for reuse.
    pub fn finish(mut self) {
        if let Some(mut conn) = self.conn.take() {
            if conn.is_closed() {
                self.pool.release_slot(&self.node);
                return;
            }
            conn.update_last_used();
            self.pool.return_connection(&self.node, conn);
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until finish")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until finish")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            debug!(node = %self.node, peer = %conn.peer_addr(), "discarding connection");
            conn.close();
            self.pool.release_slot(&self.node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddr, TcpListener};
    use std::thread;

    fn setup(policy: ClientPolicy) -> (TcpListener, Node, ConnectionPool) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr: SocketAddr = listener.local_addr().expect("addr");
        let node = Node::new("A", addr);
        let pool = ConnectionPool::new(&policy, None);
        (listener, node, pool)
    }

    #[test]
    fn test_finish_returns_connection() {
        let (_listener, node, pool) = setup(ClientPolicy::default());

        let conn = pool.acquire(&node).unwrap();
        assert_eq!(pool.total_count("A"), 1);
        conn.finish();
        assert_eq!(pool.idle_count("A"), 1);

        let conn = pool.acquire(&node).unwrap();
        assert_eq!(pool.idle_count("A"), 0);
        assert_eq!(pool.total_count("A"), 1);
        conn.finish();
    }

    #[test]
    fn test_drop_discards_connection() {
        let (_listener, node, pool) = setup(ClientPolicy::default());

        let conn = pool.acquire(&node).unwrap();
        drop(conn);
        assert_eq!(pool.idle_count("A"), 0);
        assert_eq!(pool.total_count("A"), 0);
    }

    #[test]
    fn test_pool_exhausted() {
        let policy = ClientPolicy {
            max_conns_per_node: 1,
            ..ClientPolicy::default()
        };
        let (_listener, node, pool) = setup(policy);

        let held = pool.acquire(&node).unwrap();
        let err = pool.acquire(&node).err().expect("second acquire should fail");
        assert!(matches!(err, ClientError::PoolExhausted));

        held.finish();
        assert!(pool.acquire(&node).is_ok());
    }

    #[test]
    fn test_stale_connections_evicted() {
        let policy = ClientPolicy {
            max_socket_idle: Duration::from_millis(30),
            ..ClientPolicy::default()
        };
        let (_listener, node, pool) = setup(policy);

        pool.acquire(&node).unwrap().finish();
        assert_eq!(pool.idle_count("A"), 1);
        thread::sleep(Duration::from_millis(60));

        let conn = pool.acquire(&node).unwrap();
        assert!(conn.is_valid());
        // The stale one was closed and replaced by a fresh one.
        assert_eq!(pool.total_count("A"), 1);
        assert_eq!(pool.idle_count("A"), 0);
    }

    #[test]
    fn test_closed_connection_not_reused() {
        let (_listener, node, pool) = setup(ClientPolicy::default());

        let mut conn = pool.acquire(&node).unwrap();
        conn.close();
        conn.finish();
        assert_eq!(pool.idle_count("A"), 0);
        assert_eq!(pool.total_count("A"), 0);
    }

    #[test]
    fn test_clear_closes_idle() {
        let (_listener, node, pool) = setup(ClientPolicy::default());
        pool.acquire(&node).unwrap().finish();
        pool.clear();
        assert_eq!(pool.idle_count("A"), 0);
        assert_eq!(pool.total_count("A"), 0);
    }
}

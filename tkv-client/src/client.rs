//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking read API over the command executor,
//! the connection pool, and a partition map.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pooling, routing, and protocol details.
//! 2. **Per-Thread Context**: Calls on one thread share a response buffer
//!    that keeps the largest size it has grown to.
//! 3. **Fail Fast**: Invalid TLS configuration is rejected at construction.

use std::cell::RefCell;
use std::sync::Arc;

use tkv_common::{ClientResult, Key, Record};

use crate::cluster::PartitionMap;
use crate::command::{Command, Executor, ReadCommand, ReadHeaderCommand, RecordListener};
use crate::decoder::{ResponseBuffer, DEFAULT_BUFFER_SIZE};
use crate::policy::{ClientPolicy, Policy};
use crate::pool::ConnectionPool;
use crate::tls::TlsConnector;

thread_local! {
    // Taken for the duration of a call, so a nested call from a listener
    // gets its own buffers instead of a borrow error.
    static BUFFERS: RefCell<Option<(ResponseBuffer, Vec<u8>)>> = const { RefCell::new(None) };
}

/// Blocking client for single-record reads.
///
/// Cheap to clone; clones share the pool and partition map.
#[derive(Clone)]
pub struct Client {
    pool: ConnectionPool,
    partitions: Arc<dyn PartitionMap>,
}

impl Client {
    /// Creates a client over the given topology snapshot.
    pub fn new(policy: ClientPolicy, partitions: Arc<dyn PartitionMap>) -> ClientResult<Self> {
        let tls = policy.tls.as_ref().map(TlsConnector::new).transpose()?;
        Ok(Client {
            pool: ConnectionPool::new(&policy, tls),
            partitions,
        })
    }

    /// Reads a record. `bins` of `None` reads every bin.
    ///
    /// Returns `Ok(None)` when the key does not exist.
    pub fn get(&self, policy: &Policy, key: &Key, bins: Option<&[String]>) -> ClientResult<Option<Record>> {
        let command = ReadCommand::new(key.clone(), bins.map(<[String]>::to_vec), None);
        self.execute(policy, Box::new(command))
    }

    /// Reads only generation and expiration.
    pub fn get_header(&self, policy: &Policy, key: &Key) -> ClientResult<Option<Record>> {
        let command = ReadHeaderCommand::new(key.clone(), None);
        self.execute(policy, Box::new(command))
    }

    /// Reads a record and reports the outcome to `listener` exactly once.
    pub fn get_with_listener(
        &self,
        policy: &Policy,
        key: &Key,
        bins: Option<&[String]>,
        listener: Arc<dyn RecordListener>,
    ) {
        let command = ReadCommand::new(key.clone(), bins.map(<[String]>::to_vec), Some(listener));
        // The listener has already observed the outcome.
        let _ = self.execute(policy, Box::new(command));
    }

    /// New execution context sharing this client's pool.
    pub fn executor(&self) -> Executor {
        Executor::new(self.pool.clone(), Arc::clone(&self.partitions))
    }

    /// Connection pool shared by every executor of this client.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Capacity of the calling thread's response buffer.
    pub fn response_buffer_capacity(&self) -> usize {
        BUFFERS.with(|cell| {
            cell.borrow()
                .as_ref()
                .map_or(DEFAULT_BUFFER_SIZE, |(buffer, _)| buffer.capacity())
        })
    }

    fn execute(&self, policy: &Policy, command: Box<dyn Command>) -> ClientResult<Option<Record>> {
        let (buffer, request) = BUFFERS
            .with(|cell| cell.borrow_mut().take())
            .unwrap_or_else(|| (ResponseBuffer::new(), Vec::with_capacity(256)));
        let mut executor =
            Executor::with_buffers(self.pool.clone(), Arc::clone(&self.partitions), buffer, request);
        let result = executor.execute(policy, command);
        let buffers = executor.into_buffers();
        BUFFERS.with(|cell| *cell.borrow_mut() = Some(buffers));
        result
    }

    /// Closes idle pooled connections.
    pub fn close(&self) {
        self.pool.clear();
    }
}

//! # TideKV Sync Client
//!
//! Purpose: Provide the client-side read path of TideKV: request encoding,
//! routing to partition owners, pooled plain or TLS connections, and
//! response decoding into typed records.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse node connections to avoid repeated
//!    TCP and TLS handshakes.
//! 2. **Exactly-Once Completion**: Every logical request reaches its
//!    listener once, however many attempts it takes.
//! 3. **Minimal Allocation**: Request and response buffers live in the
//!    execution context and are reused across requests.
//! 4. **Fail Closed**: Peer identity checks reject anything short of an
//!    exact name match.

mod client;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod decoder;
pub mod encoder;
pub mod policy;
pub mod pool;
pub mod tls;

pub use client::Client;
pub use cluster::{Node, PartitionMap, Replica, StaticPartitionMap};
pub use command::{Command, CommandState, Executor, ReadCommand, ReadHeaderCommand, RecordListener};
pub use connection::Connection;
pub use decoder::ResponseBuffer;
pub use policy::{ClientPolicy, ConsistencyLevel, Policy};
pub use tls::{PeerIdentity, TlsConnector, TlsPolicy, X509Identity};
pub use tkv_common::{ClientError, ClientResult, Key, Partition, ReadOutcome, Record, ResultCode, Value};

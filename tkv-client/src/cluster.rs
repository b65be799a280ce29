//! # Cluster Topology Snapshot
//!
//! Purpose: Describe nodes and partition ownership as seen by one request,
//! and pick the node a read should target.
//!
//! ## Design Principles
//! 1. **Snapshot In, Node Out**: Node selection is a pure function of the
//!    snapshot it is given and the replica policy.
//! 2. **External Tending**: Discovering nodes and refreshing ownership lives
//!    outside this crate; `PartitionMap` is the seam.
//!
//! ## Structure Overview
//!
//! ```text
//! StaticPartitionMap
//!   └── namespaces: HashMap<String, NamespaceOwners>
//!         └── NamespaceOwners
//!               ├── default: Vec<Arc<Node>>          (master first)
//!               └── partitions: HashMap<u32, Vec<Arc<Node>>>
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tkv_common::{ClientError, ClientResult, Partition};

/// Which owning node a read may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Replica {
    /// Only the master.
    Master,
    /// First active node in ownership order (master, then replicas).
    #[default]
    Sequence,
    /// First active non-master replica, falling back to the master.
    PreferReplica,
}

/// A server node.
pub struct Node {
    name: String,
    address: SocketAddr,
    tls_name: Option<String>,
    active: AtomicBool,
}

impl Node {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Node {
            name: name.into(),
            address,
            tls_name: None,
            active: AtomicBool::new(true),
        }
    }

    /// Sets the name the node's TLS certificate must carry.
    pub fn with_tls_name(mut self, tls_name: impl Into<String>) -> Self {
        self.tls_name = Some(tls_name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn tls_name(&self) -> Option<&str> {
        self.tls_name.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the node as reachable or not. Called by the tend layer.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({} {})", self.name, self.address)
    }
}

/// Partition ownership snapshot.
pub trait PartitionMap: Send + Sync {
    /// Owners of `partition`, master first. `None` when the namespace or
    /// partition is unknown.
    fn replicas(&self, partition: &Partition) -> Option<&[Arc<Node>]>;
}

/// Picks the node a read of `partition` should target.
pub fn select_node(
    map: &dyn PartitionMap,
    partition: &Partition,
    replica: Replica,
) -> ClientResult<Arc<Node>> {
    let owners = map
        .replicas(partition)
        .filter(|owners| !owners.is_empty())
        .ok_or_else(|| ClientError::NoAvailableNode(format!("partition {} has no owners", partition)))?;

    let master = owners.first().filter(|node| node.is_active());
    let chosen = match replica {
        Replica::Master => master,
        Replica::Sequence => owners.iter().find(|node| node.is_active()),
        Replica::PreferReplica => owners.iter().skip(1).find(|node| node.is_active()).or(master),
    };

    chosen.cloned().ok_or_else(|| {
        ClientError::NoAvailableNode(format!("no active node for partition {} ({:?})", partition, replica))
    })
}

#[derive(Default)]
struct NamespaceOwners {
    default: Vec<Arc<Node>>,
    partitions: HashMap<u32, Vec<Arc<Node>>>,
}

/// In-memory `PartitionMap` for fixed topologies and tests.
#[derive(Default)]
pub struct StaticPartitionMap {
    namespaces: HashMap<String, NamespaceOwners>,
}

impl StaticPartitionMap {
    pub fn new() -> Self {
        StaticPartitionMap::default()
    }

    /// Assigns the same owners to every partition of `namespace`.
    pub fn with_namespace(mut self, namespace: impl Into<String>, owners: Vec<Arc<Node>>) -> Self {
        self.namespaces.entry(namespace.into()).or_default().default = owners;
        self
    }

    /// Overrides the owners of one partition.
    pub fn with_partition(
        mut self,
        namespace: impl Into<String>,
        partition_id: u32,
        owners: Vec<Arc<Node>>,
    ) -> Self {
        self.namespaces
            .entry(namespace.into())
            .or_default()
            .partitions
            .insert(partition_id, owners);
        self
    }
}

impl PartitionMap for StaticPartitionMap {
    fn replicas(&self, partition: &Partition) -> Option<&[Arc<Node>]> {
        let ns = self.namespaces.get(&partition.namespace)?;
        let owners = ns.partitions.get(&partition.partition_id).unwrap_or(&ns.default);
        Some(owners.as_slice())
    }
}

//! # Client Policies
//!
//! Purpose: Carry per-request and per-client tuning as plain, serializable
//! configuration structs.
//!
//! Durations are written as integer milliseconds in serialized form.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::Replica;
use crate::connection::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_SOCKET_IDLE};
use crate::tls::TlsPolicy;

/// Read consistency requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    /// Read from one copy.
    #[default]
    One,
    /// Ask the server to consult every copy.
    All,
}

/// Per-request policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Total time budget for the request, retries included. Zero means none.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Pause before each retry.
    #[serde(with = "millis")]
    pub sleep_between_retries: Duration,
    /// Which owning node a read may target.
    pub replica: Replica,
    /// Consistency level sent with the request.
    pub consistency: ConsistencyLevel,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            timeout: Duration::ZERO,
            max_retries: 1,
            sleep_between_retries: Duration::from_millis(500),
            replica: Replica::Sequence,
            consistency: ConsistencyLevel::One,
        }
    }
}

/// Client-wide policy for connections and pooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientPolicy {
    /// Socket connect timeout.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Idle budget after which a pooled connection is discarded.
    #[serde(with = "millis")]
    pub max_socket_idle: Duration,
    /// Maximum connections (idle + in use) per node.
    pub max_conns_per_node: usize,
    /// Transport security; `None` uses plain TCP.
    pub tls: Option<TlsPolicy>,
}

impl Default for ClientPolicy {
    fn default() -> Self {
        ClientPolicy {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_socket_idle: DEFAULT_MAX_SOCKET_IDLE,
            max_conns_per_node: 300,
            tls: None,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_json() {
        let policy: Policy = serde_json::from_str(
            r#"{"timeout": 250, "max_retries": 3, "replica": "master", "consistency": "all"}"#,
        )
        .unwrap();
        assert_eq!(policy.timeout, Duration::from_millis(250));
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.replica, Replica::Master);
        assert_eq!(policy.consistency, ConsistencyLevel::All);
        // Unspecified fields keep their defaults.
        assert_eq!(policy.sleep_between_retries, Duration::from_millis(500));
    }

    #[test]
    fn test_client_policy_defaults() {
        let policy: ClientPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(policy.max_socket_idle, Duration::from_secs(55));
        assert_eq!(policy.max_conns_per_node, 300);
        assert!(policy.tls.is_none());
    }

    #[test]
    fn test_client_policy_with_tls() {
        let policy: ClientPolicy = serde_json::from_str(
            r#"{"max_socket_idle": 1000, "tls": {"protocols": ["TLSv1.3"], "encrypt_only": true}}"#,
        )
        .unwrap();
        let tls = policy.tls.unwrap();
        assert_eq!(tls.protocols, Some(vec!["TLSv1.3".to_string()]));
        assert!(tls.encrypt_only);
        assert!(tls.ciphers.is_none());
        assert_eq!(policy.max_socket_idle, Duration::from_secs(1));
    }

    #[test]
    fn test_policy_serializes_millis() {
        let json = serde_json::to_value(Policy::default()).unwrap();
        assert_eq!(json["sleep_between_retries"], 500);
        assert_eq!(json["replica"], "sequence");
    }
}

//! # Error Types
//!
//! Purpose: One error taxonomy for the whole data path, from socket setup to
//! record decoding, so callers and the retry layer can classify failures
//! without string matching.
//!
//! ## Design Principles
//! 1. **Typed Server Codes**: Server result codes travel as `ResultCode`, never
//!    as bare integers or messages.
//! 2. **Absence Is Not An Error**: "key not found" is a successful outcome and
//!    never appears as a `ClientError`.
//! 3. **Discard On Doubt**: Any error that may leave bytes unread on a socket
//!    marks the connection unusable.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for the client data path.
pub type ClientResult<T> = Result<T, ClientError>;

/// Server result code carried in byte 5 of every response message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u8);

impl ResultCode {
    pub const OK: ResultCode = ResultCode(0);
    pub const SERVER_ERROR: ResultCode = ResultCode(1);
    pub const KEY_NOT_FOUND: ResultCode = ResultCode(2);
    pub const GENERATION_ERROR: ResultCode = ResultCode(3);
    pub const PARAMETER_ERROR: ResultCode = ResultCode(4);
    pub const KEY_EXISTS: ResultCode = ResultCode(5);
    pub const BIN_EXISTS: ResultCode = ResultCode(6);
    pub const CLUSTER_KEY_MISMATCH: ResultCode = ResultCode(7);
    pub const SERVER_MEM_ERROR: ResultCode = ResultCode(8);
    pub const TIMEOUT: ResultCode = ResultCode(9);
    pub const NO_XDS: ResultCode = ResultCode(10);
    pub const SERVER_NOT_AVAILABLE: ResultCode = ResultCode(11);
    pub const BIN_TYPE_ERROR: ResultCode = ResultCode(12);
    pub const RECORD_TOO_BIG: ResultCode = ResultCode(13);
    pub const KEY_BUSY: ResultCode = ResultCode(14);
    pub const SCAN_ABORT: ResultCode = ResultCode(15);
    pub const UNSUPPORTED_FEATURE: ResultCode = ResultCode(16);
    pub const BIN_NOT_FOUND: ResultCode = ResultCode(17);
    pub const DEVICE_OVERLOAD: ResultCode = ResultCode(18);
    pub const KEY_MISMATCH: ResultCode = ResultCode(19);
    pub const INVALID_NAMESPACE: ResultCode = ResultCode(20);
    pub const BIN_NAME_TOO_LONG: ResultCode = ResultCode(21);
    pub const FAIL_FORBIDDEN: ResultCode = ResultCode(22);

    /// Returns the raw numeric code.
    #[inline]
    pub const fn code(&self) -> u8 {
        self.0
    }

    /// Short human-readable description of well-known codes.
    pub fn description(&self) -> &'static str {
        match self.0 {
            0 => "ok",
            1 => "server error",
            2 => "key not found",
            3 => "generation error",
            4 => "parameter error",
            5 => "key already exists",
            6 => "bin already exists",
            7 => "cluster key mismatch",
            8 => "server memory error",
            9 => "server timeout",
            10 => "xds not available",
            11 => "server not available",
            12 => "bin type error",
            13 => "record too big",
            14 => "hot key",
            15 => "scan aborted",
            16 => "unsupported server feature",
            17 => "bin not found",
            18 => "device overload",
            19 => "key mismatch",
            20 => "namespace not found",
            21 => "bin name too long",
            22 => "operation forbidden",
            _ => "unknown result code",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.description())
    }
}

/// Errors surfaced by the client data path.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Malformed or truncated message. The stream is desynchronized.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Server answered with a non-zero, non-not-found result code.
    #[error("server error: {code}")]
    Database { code: ResultCode },
    /// Socket open or TLS handshake failed.
    #[error("connection setup failed: {0}")]
    ConnectionSetup(String),
    /// Peer certificate identity is missing or does not match.
    #[error("invalid server TLS name: {0}")]
    SecurityValidation(String),
    /// Peer closed the stream before a full message arrived.
    #[error("unexpected end of stream")]
    EndOfStream,
    /// Socket read or write deadline expired.
    #[error("timeout")]
    Timeout,
    /// Other network failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[source] io::Error),
    /// Topology snapshot has no usable node for the partition.
    #[error("no available node: {0}")]
    NoAvailableNode(String),
    /// Node pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Caller-supplied request parameters cannot be encoded.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClientError {
    /// Builds a protocol error from any displayable message.
    pub fn protocol(message: impl Into<String>) -> Self {
        ClientError::Protocol(message.into())
    }

    /// Builds a database error for the given result code.
    pub fn database(code: ResultCode) -> Self {
        ClientError::Database { code }
    }

    /// Returns the server result code for database errors.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            ClientError::Database { code } => Some(*code),
            _ => None,
        }
    }

    /// True when a fresh attempt on a new connection may succeed.
    ///
    /// Database errors are final answers from the server and are never
    /// retried here; protocol and security failures are not transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionSetup(_)
                | ClientError::EndOfStream
                | ClientError::Timeout
                | ClientError::Io(_)
                | ClientError::NoAvailableNode(_)
                | ClientError::PoolExhausted
        )
    }

    /// True when the connection that produced this error may be pooled again.
    ///
    /// Only errors raised after the full response was consumed qualify.
    pub fn keeps_connection(&self) -> bool {
        matches!(self, ClientError::Database { .. })
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ClientError::EndOfStream,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ClientError::Timeout,
            _ => ClientError::Io(err),
        }
    }
}

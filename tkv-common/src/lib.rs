// tkv-common - Shared types and wire protocol definitions for TideKV
//
// This crate defines the record model, the binary message layout, and the
// error taxonomy used by the client data path.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;

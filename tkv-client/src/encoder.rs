//! # Request Encoding
//!
//! Purpose: Render read requests into the binary message format the decoder
//! mirrors.
//!
//! ## Design Principles
//! 1. **Buffer Reuse**: Callers pass the output buffer; it is cleared, not
//!    reallocated, between attempts.
//! 2. **Size First**: The proto header size is patched in after the body is
//!    written, so no pre-pass over bins is needed.
//! 3. **Validate Before Send**: Parameters the server would reject are
//!    refused locally.

use std::time::Duration;

use bytes::BufMut;
use tkv_common::protocol::{
    ProtoHeader, FIELD_DIGEST, FIELD_NAMESPACE, FIELD_SET, INFO1_CONSISTENCY_ALL, INFO1_GET_ALL,
    INFO1_NOBINDATA, INFO1_READ, MAX_BIN_NAME_LEN, MSG_REMAINING_HEADER_SIZE, OP_READ,
    OP_SUB_HEADER_SIZE, PROTO_HEADER_SIZE,
};
use tkv_common::{ClientError, ClientResult, Key};

use crate::policy::{ConsistencyLevel, Policy};

/// Which part of the record a read asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadScope<'a> {
    /// Every bin.
    All,
    /// Only the named bins.
    Bins(&'a [String]),
    /// Generation and expiration only.
    Header,
}

/// Encodes a single-record read into `out`, replacing its contents.
pub fn encode_read(out: &mut Vec<u8>, policy: &Policy, key: &Key, scope: ReadScope<'_>) -> ClientResult<()> {
    let bins: &[String] = match scope {
        ReadScope::Bins(bins) => {
            if let Some(name) = bins.iter().find(|name| name.len() > MAX_BIN_NAME_LEN) {
                return Err(ClientError::InvalidArgument(format!(
                    "bin name {:?} exceeds {} bytes",
                    name, MAX_BIN_NAME_LEN
                )));
            }
            bins
        }
        _ => &[],
    };
    let mut info1 = INFO1_READ;
    match scope {
        // An empty bin list reads everything.
        ReadScope::All => info1 |= INFO1_GET_ALL,
        ReadScope::Bins(names) if names.is_empty() => info1 |= INFO1_GET_ALL,
        ReadScope::Bins(_) => {}
        ReadScope::Header => info1 |= INFO1_NOBINDATA,
    }
    if policy.consistency == ConsistencyLevel::All {
        info1 |= INFO1_CONSISTENCY_ALL;
    }

    let mut field_count: u16 = 2;
    if !key.set_name().is_empty() {
        field_count += 1;
    }
    let op_count = u16::try_from(bins.len())
        .map_err(|_| ClientError::InvalidArgument(format!("{} bins requested", bins.len())))?;

    out.clear();
    out.put_bytes(0, PROTO_HEADER_SIZE);

    // Message header.
    out.put_u8(MSG_REMAINING_HEADER_SIZE as u8);
    out.put_u8(info1);
    out.put_u8(0); // info2
    out.put_u8(0); // info3
    out.put_u8(0); // unused
    out.put_u8(0); // result code
    out.put_u32(0); // generation
    out.put_u32(0); // record ttl
    out.put_u32(transaction_ttl(policy.timeout));
    out.put_u16(field_count);
    out.put_u16(op_count);

    put_field(out, FIELD_NAMESPACE, key.namespace().as_bytes());
    if !key.set_name().is_empty() {
        put_field(out, FIELD_SET, key.set_name().as_bytes());
    }
    put_field(out, FIELD_DIGEST, key.digest());

    for name in bins {
        out.put_u32((OP_SUB_HEADER_SIZE + name.len()) as u32);
        out.put_u8(OP_READ);
        out.put_u8(0); // particle type
        out.put_u8(0); // version
        out.put_u8(name.len() as u8);
        out.put_slice(name.as_bytes());
    }

    let header = ProtoHeader::new(out.len() - PROTO_HEADER_SIZE);
    out[..PROTO_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    Ok(())
}

fn put_field(out: &mut Vec<u8>, field_type: u8, data: &[u8]) {
    out.put_u32(data.len() as u32 + 1);
    out.put_u8(field_type);
    out.put_slice(data);
}

fn transaction_ttl(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

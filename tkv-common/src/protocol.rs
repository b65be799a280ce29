//! # Wire Protocol Definitions
//!
//! Purpose: Define the byte layout shared by the request encoder and the
//! response decoder.
//!
//! ## Design Principles
//!
//! 1. **Big-Endian Everywhere**: All multi-byte header and length fields are
//!    network byte order.
//! 2. **Length-Prefixed Payload**: Every field and operation entry starts with
//!    a 4-byte size, so a reader can always skip what it does not understand.
//! 3. **Bounded Reads**: Decoders validate each declared span against the
//!    message end before touching it.
//!
//! ## Memory Layout Example
//!
//! ```text
//! ProtoHeader (8 bytes, precedes every message):
//! +-----------+--------+---------------------+
//! | version:1B| type:1B| size:6B (message)   |
//! +-----------+--------+---------------------+
//!
//! MessageHeader (22 bytes):
//! +-----------+--------+--------+--------+----------+-----------+
//! | hdr_sz:1B | info1  | info2  | info3  | unused:1B| result:1B |
//! +-----------+--------+--------+--------+----------+-----------+
//! | generation:4B      | expiration:4B   | transaction_ttl:4B   |
//! +--------------------+-----------------+----------------------+
//! | n_fields:2B        | n_ops:2B        |
//! +--------------------+-----------------+
//!
//! Field entry:
//! +---------+---------+-----------------+
//! | size:4B | type:1B | data:(size-1)B  |
//! +---------+---------+-----------------+
//!
//! Operation entry:
//! +---------+-------+-------------+----------+-------------+------+-------+
//! | size:4B | op:1B | particle:1B | version:1B| name_len:1B | name | value |
//! +---------+-------+-------------+----------+-------------+------+-------+
//! value_len = size - (OP_SUB_HEADER_SIZE + name_len)
//! ```

use crate::error::{ClientError, ClientResult};
use crate::types::Value;

/// Protocol version written in the proto header.
pub const PROTO_VERSION: u8 = 2;

/// Proto header message type for single-record messages.
pub const PROTO_TYPE_MESSAGE: u8 = 3;

/// Size of the proto header preceding each message.
pub const PROTO_HEADER_SIZE: usize = 8;

/// Size of the message header; the variable payload begins here.
pub const MSG_REMAINING_HEADER_SIZE: usize = 22;

/// Proto header plus message header.
pub const MSG_TOTAL_HEADER_SIZE: usize = PROTO_HEADER_SIZE + MSG_REMAINING_HEADER_SIZE;

/// Largest message body the client will accept.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Bytes of an operation entry between its size field and its name.
pub const OP_SUB_HEADER_SIZE: usize = 4;

/// Maximum bin name length accepted by the server.
pub const MAX_BIN_NAME_LEN: usize = 15;

// Message header offsets.
pub const OFFSET_HEADER_SIZE: usize = 0;
pub const OFFSET_INFO1: usize = 1;
pub const OFFSET_RESULT_CODE: usize = 5;
pub const OFFSET_GENERATION: usize = 6;
pub const OFFSET_EXPIRATION: usize = 10;
pub const OFFSET_TRANSACTION_TTL: usize = 14;
pub const OFFSET_FIELD_COUNT: usize = 18;
pub const OFFSET_OP_COUNT: usize = 20;

// info1 bits.
pub const INFO1_READ: u8 = 1;
pub const INFO1_GET_ALL: u8 = 1 << 1;
pub const INFO1_NOBINDATA: u8 = 1 << 5;
pub const INFO1_CONSISTENCY_ALL: u8 = 1 << 6;

// Field types.
pub const FIELD_NAMESPACE: u8 = 0;
pub const FIELD_SET: u8 = 1;
pub const FIELD_DIGEST: u8 = 4;

// Operation types.
pub const OP_READ: u8 = 1;

// Particle types.
pub const PARTICLE_NULL: u8 = 0;
pub const PARTICLE_INTEGER: u8 = 1;
pub const PARTICLE_FLOAT: u8 = 2;
pub const PARTICLE_STRING: u8 = 3;
pub const PARTICLE_BLOB: u8 = 4;
pub const PARTICLE_LANG_BLOB_FIRST: u8 = 5;
pub const PARTICLE_LANG_BLOB_LAST: u8 = 11;
pub const PARTICLE_BOOL: u8 = 17;
pub const PARTICLE_MAP: u8 = 19;
pub const PARTICLE_LIST: u8 = 20;

/// Decoded proto header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoHeader {
    pub version: u8,
    pub message_type: u8,
    /// Size of the message body that follows.
    pub size: usize,
}

impl ProtoHeader {
    /// Builds a header for a single-record message body of `size` bytes.
    pub const fn new(size: usize) -> Self {
        ProtoHeader {
            version: PROTO_VERSION,
            message_type: PROTO_TYPE_MESSAGE,
            size,
        }
    }

    /// Serializes the header into its 8-byte wire form.
    pub fn to_bytes(&self) -> [u8; PROTO_HEADER_SIZE] {
        let size = (self.size as u64).to_be_bytes();
        let mut out = [0u8; PROTO_HEADER_SIZE];
        out[0] = self.version;
        out[1] = self.message_type;
        out[2..].copy_from_slice(&size[2..]);
        out
    }

    /// Parses and validates an 8-byte proto header.
    pub fn parse(bytes: &[u8; PROTO_HEADER_SIZE]) -> ClientResult<Self> {
        let mut size = [0u8; 8];
        size[2..].copy_from_slice(&bytes[2..]);
        let header = ProtoHeader {
            version: bytes[0],
            message_type: bytes[1],
            size: u64::from_be_bytes(size) as usize,
        };

        if header.version != PROTO_VERSION {
            return Err(ClientError::protocol(format!(
                "unsupported proto version {}",
                header.version
            )));
        }
        if header.message_type != PROTO_TYPE_MESSAGE {
            return Err(ClientError::protocol(format!(
                "unexpected proto type {}",
                header.message_type
            )));
        }
        if header.size < MSG_REMAINING_HEADER_SIZE || header.size > MAX_MESSAGE_SIZE {
            return Err(ClientError::protocol(format!(
                "invalid message size {}",
                header.size
            )));
        }
        Ok(header)
    }
}

/// Decodes one particle into a typed value.
///
/// `bytes` is exactly the value span of an operation entry.
pub fn decode_particle(particle_type: u8, bytes: &[u8]) -> ClientResult<Value> {
    match particle_type {
        PARTICLE_NULL => Ok(Value::Nil),
        PARTICLE_INTEGER => decode_integer(bytes).map(Value::Int),
        PARTICLE_FLOAT => {
            let raw: [u8; 8] = bytes
                .try_into()
                .map_err(|_| ClientError::protocol(format!("float particle of {} bytes", bytes.len())))?;
            Ok(Value::Float(f64::from_be_bytes(raw)))
        }
        PARTICLE_STRING => std::str::from_utf8(bytes)
            .map(|s| Value::Str(s.to_string()))
            .map_err(|_| ClientError::protocol("string particle is not valid UTF-8")),
        PARTICLE_BLOB | PARTICLE_LANG_BLOB_FIRST..=PARTICLE_LANG_BLOB_LAST => {
            Ok(Value::Blob(bytes.to_vec()))
        }
        PARTICLE_BOOL => match bytes {
            [flag] => Ok(Value::Bool(*flag != 0)),
            _ => Err(ClientError::protocol(format!("bool particle of {} bytes", bytes.len()))),
        },
        PARTICLE_MAP => Ok(Value::Map(bytes.to_vec())),
        PARTICLE_LIST => Ok(Value::List(bytes.to_vec())),
        other => Ok(Value::Other {
            particle_type: other,
            bytes: bytes.to_vec(),
        }),
    }
}

fn decode_integer(bytes: &[u8]) -> ClientResult<i64> {
    match bytes.len() {
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            Ok(i64::from_be_bytes(raw))
        }
        0..=7 => Ok(bytes.iter().fold(0i64, |acc, b| (acc << 8) | i64::from(*b))),
        len => Err(ClientError::protocol(format!("integer particle of {} bytes", len))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_header_layout() {
        let header = ProtoHeader::new(0x0102_0304_0506);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [2, 3, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn test_proto_header_rejects_bad_version() {
        let mut bytes = ProtoHeader::new(64).to_bytes();
        bytes[0] = 9;
        assert!(matches!(ProtoHeader::parse(&bytes), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn test_proto_header_rejects_short_and_huge_sizes() {
        let short = ProtoHeader::new(MSG_REMAINING_HEADER_SIZE - 1).to_bytes();
        assert!(ProtoHeader::parse(&short).is_err());

        let huge = ProtoHeader::new(MAX_MESSAGE_SIZE + 1).to_bytes();
        assert!(ProtoHeader::parse(&huge).is_err());

        let ok = ProtoHeader::new(MSG_REMAINING_HEADER_SIZE).to_bytes();
        assert_eq!(ProtoHeader::parse(&ok).unwrap().size, MSG_REMAINING_HEADER_SIZE);
    }

    #[test]
    fn test_decode_integer_particles() {
        let v = decode_particle(PARTICLE_INTEGER, &(-42i64).to_be_bytes()).unwrap();
        assert_eq!(v, Value::Int(-42));

        let v = decode_particle(PARTICLE_INTEGER, &[0x01, 0x00]).unwrap();
        assert_eq!(v, Value::Int(256));

        assert_eq!(decode_particle(PARTICLE_INTEGER, &[]).unwrap(), Value::Int(0));
        assert!(decode_particle(PARTICLE_INTEGER, &[0u8; 9]).is_err());
    }

    #[test]
    fn test_decode_scalar_particles() {
        assert_eq!(decode_particle(PARTICLE_NULL, &[]).unwrap(), Value::Nil);
        assert_eq!(
            decode_particle(PARTICLE_FLOAT, &1.5f64.to_be_bytes()).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(
            decode_particle(PARTICLE_STRING, b"hello").unwrap(),
            Value::Str("hello".to_string())
        );
        assert_eq!(decode_particle(PARTICLE_STRING, b"").unwrap(), Value::Str(String::new()));
        assert_eq!(decode_particle(PARTICLE_BOOL, &[1]).unwrap(), Value::Bool(true));
        assert!(decode_particle(PARTICLE_STRING, &[0xFF, 0xFE]).is_err());
        assert!(decode_particle(PARTICLE_FLOAT, &[0u8; 4]).is_err());
    }

    #[test]
    fn test_decode_opaque_particles() {
        assert_eq!(decode_particle(PARTICLE_BLOB, &[1, 2]).unwrap(), Value::Blob(vec![1, 2]));
        assert_eq!(decode_particle(7, &[3]).unwrap(), Value::Blob(vec![3]));
        assert_eq!(decode_particle(PARTICLE_LIST, &[0x90]).unwrap(), Value::List(vec![0x90]));
        assert_eq!(decode_particle(PARTICLE_MAP, &[0x80]).unwrap(), Value::Map(vec![0x80]));
        assert_eq!(
            decode_particle(42, &[9]).unwrap(),
            Value::Other {
                particle_type: 42,
                bytes: vec![9]
            }
        );
    }
}

//! # Response Decoding
//!
//! Purpose: Turn one response message into a `ReadOutcome` without reading
//! a byte outside the message.
//!
//! ## Design Principles
//! 1. **Caller-Owned Buffer**: `ResponseBuffer` belongs to one execution
//!    context and is passed in explicitly; it only grows.
//! 2. **Checked Cursor**: Every length field is validated against the message
//!    end before the span is consumed.
//! 3. **Exact Consumption**: Decoding must end precisely at the message end;
//!    leftover or missing bytes are protocol errors.

use std::collections::HashMap;

use tkv_common::protocol::{
    decode_particle, MSG_REMAINING_HEADER_SIZE, OFFSET_EXPIRATION, OFFSET_FIELD_COUNT,
    OFFSET_GENERATION, OFFSET_OP_COUNT, OFFSET_RESULT_CODE, OP_SUB_HEADER_SIZE,
};
use tkv_common::{ClientError, ClientResult, ReadOutcome, Record, ResultCode};
use tracing::trace;

/// Initial size of a fresh response buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Growable scratch area for response messages.
///
/// Capacity grows to the largest message seen and never shrinks, so the
/// buffer settles at the working-set size of its execution context.
#[derive(Debug)]
pub struct ResponseBuffer {
    data: Vec<u8>,
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        ResponseBuffer::new()
    }
}

impl ResponseBuffer {
    pub fn new() -> Self {
        ResponseBuffer::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ResponseBuffer {
            data: vec![0u8; capacity],
        }
    }

    /// Usable bytes without growing.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Grows to at least `size` bytes.
    pub fn ensure(&mut self, size: usize) {
        if self.data.len() < size {
            self.data.resize(size, 0);
        }
    }

    /// Copies exactly `receive_size` bytes from `src` into the buffer.
    ///
    /// Used when an event loop has already gathered the message bytes.
    pub fn fill_from(&mut self, src: &[u8], receive_size: usize) -> ClientResult<&[u8]> {
        if src.len() < receive_size {
            return Err(ClientError::protocol(format!(
                "message declares {} bytes, {} available",
                receive_size,
                src.len()
            )));
        }
        self.ensure(receive_size);
        self.data[..receive_size].copy_from_slice(&src[..receive_size]);
        Ok(&self.data[..receive_size])
    }

    /// Exposes `size` writable bytes for a direct socket read.
    pub fn message_mut(&mut self, size: usize) -> &mut [u8] {
        self.ensure(size);
        &mut self.data[..size]
    }

    /// First `size` bytes of the buffer.
    ///
    /// # Panics
    /// Panics if `size` exceeds the capacity.
    pub fn message(&self, size: usize) -> &[u8] {
        &self.data[..size]
    }
}

/// Decodes a single-record response message.
///
/// `message` must be exactly one message body, starting at the 22-byte
/// message header.
pub fn decode_record(message: &[u8]) -> ClientResult<ReadOutcome> {
    decode(message, true)
}

/// Decodes a response that must not carry bin data.
pub fn decode_header(message: &[u8]) -> ClientResult<ReadOutcome> {
    decode(message, false)
}

fn decode(message: &[u8], with_bins: bool) -> ClientResult<ReadOutcome> {
    let mut cursor = Cursor::new(message);
    cursor.require(MSG_REMAINING_HEADER_SIZE)?;

    let result_code = ResultCode(message[OFFSET_RESULT_CODE]);
    let generation = cursor.u32_at(OFFSET_GENERATION)?;
    let expiration = cursor.u32_at(OFFSET_EXPIRATION)?;
    let field_count = cursor.u16_at(OFFSET_FIELD_COUNT)?;
    let op_count = cursor.u16_at(OFFSET_OP_COUNT)?;
    cursor.advance(MSG_REMAINING_HEADER_SIZE)?;

    if result_code == ResultCode::KEY_NOT_FOUND {
        return Ok(ReadOutcome::Absent);
    }
    if result_code != ResultCode::OK {
        return Err(ClientError::database(result_code));
    }

    for _ in 0..field_count {
        let size = cursor.read_u32()? as usize;
        cursor.advance(size)?;
    }

    if !with_bins && op_count > 0 {
        return Err(ClientError::protocol(format!(
            "header response carried {} operations",
            op_count
        )));
    }

    let mut bins = HashMap::with_capacity(op_count as usize);
    for _ in 0..op_count {
        let op_size = cursor.read_u32()? as usize;
        let entry = cursor.take(op_size)?;
        if entry.len() < OP_SUB_HEADER_SIZE {
            return Err(ClientError::protocol(format!("op size {} below sub-header", op_size)));
        }

        let particle_type = entry[1];
        let name_len = entry[3] as usize;
        let value_len = op_size
            .checked_sub(OP_SUB_HEADER_SIZE + name_len)
            .ok_or_else(|| ClientError::protocol(format!("bin name of {} bytes overruns op", name_len)))?;

        let name_end = OP_SUB_HEADER_SIZE + name_len;
        let name = std::str::from_utf8(&entry[OP_SUB_HEADER_SIZE..name_end])
            .map_err(|_| ClientError::protocol("bin name is not valid UTF-8"))?;
        let value = decode_particle(particle_type, &entry[name_end..name_end + value_len])?;

        // Last write wins on duplicate names.
        bins.insert(name.to_string(), value);
    }

    if !cursor.is_at_end() {
        return Err(ClientError::protocol(format!(
            "{} trailing bytes after last operation",
            cursor.remaining()
        )));
    }

    trace!(generation, expiration, bins = bins.len(), "record decoded");
    Ok(ReadOutcome::Found(Record::new(bins, generation, expiration)))
}

/// Forward-only reader over one message.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    fn require(&self, len: usize) -> ClientResult<()> {
        if self.remaining() < len {
            return Err(ClientError::protocol(format!(
                "need {} bytes at offset {}, {} remain",
                len,
                self.pos,
                self.remaining()
            )));
        }
        Ok(())
    }

    fn advance(&mut self, len: usize) -> ClientResult<()> {
        self.require(len)?;
        self.pos += len;
        Ok(())
    }

    fn take(&mut self, len: usize) -> ClientResult<&'a [u8]> {
        self.require(len)?;
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u32(&mut self) -> ClientResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    // Absolute reads inside the fixed header.
    fn u32_at(&self, offset: usize) -> ClientResult<u32> {
        let bytes = self.slice_at(offset, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u16_at(&self, offset: usize) -> ClientResult<u16> {
        let bytes = self.slice_at(offset, 2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn slice_at(&self, offset: usize, len: usize) -> ClientResult<&'a [u8]> {
        self.data
            .get(offset..offset + len)
            .ok_or_else(|| ClientError::protocol(format!("header field at {} out of range", offset)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tkv_common::protocol::{OP_READ, PARTICLE_INTEGER, PARTICLE_STRING};
    use tkv_common::Value;

    /// Builds a response message body (no proto header).
    pub(crate) fn build_message(
        result_code: u8,
        generation: u32,
        expiration: u32,
        fields: &[&[u8]],
        ops: &[(&str, u8, &[u8])],
    ) -> Vec<u8> {
        let mut msg = vec![0u8; MSG_REMAINING_HEADER_SIZE];
        msg[0] = MSG_REMAINING_HEADER_SIZE as u8;
        msg[OFFSET_RESULT_CODE] = result_code;
        msg[OFFSET_GENERATION..OFFSET_GENERATION + 4].copy_from_slice(&generation.to_be_bytes());
        msg[OFFSET_EXPIRATION..OFFSET_EXPIRATION + 4].copy_from_slice(&expiration.to_be_bytes());
        msg[OFFSET_FIELD_COUNT..OFFSET_FIELD_COUNT + 2]
            .copy_from_slice(&(fields.len() as u16).to_be_bytes());
        msg[OFFSET_OP_COUNT..OFFSET_OP_COUNT + 2].copy_from_slice(&(ops.len() as u16).to_be_bytes());

        for field in fields {
            msg.extend_from_slice(&(field.len() as u32).to_be_bytes());
            msg.extend_from_slice(field);
        }
        for (name, particle_type, value) in ops {
            let size = OP_SUB_HEADER_SIZE + name.len() + value.len();
            msg.extend_from_slice(&(size as u32).to_be_bytes());
            msg.extend_from_slice(&[OP_READ, *particle_type, 0, name.len() as u8]);
            msg.extend_from_slice(name.as_bytes());
            msg.extend_from_slice(value);
        }
        msg
    }

    fn found(outcome: ReadOutcome) -> Record {
        match outcome {
            ReadOutcome::Found(record) => record,
            ReadOutcome::Absent => panic!("expected a record"),
        }
    }

    #[test]
    fn test_decode_end_to_end_example() {
        let msg = build_message(0, 7, 100, &[], &[("bin1", PARTICLE_STRING, b"hello")]);
        let record = found(decode_record(&msg).unwrap());
        assert_eq!(record.generation, 7);
        assert_eq!(record.expiration, 100);
        assert_eq!(record.bins.len(), 1);
        assert_eq!(record.bin("bin1"), Some(&Value::Str("hello".to_string())));
    }

    #[test]
    fn test_decode_no_ops_yields_empty_record() {
        let msg = build_message(0, 3, 42, &[], &[]);
        let record = found(decode_record(&msg).unwrap());
        assert!(record.bins.is_empty());
        assert_eq!(record.generation, 3);
        assert_eq!(record.expiration, 42);
    }

    #[test]
    fn test_decode_not_found_is_absent() {
        let msg = build_message(ResultCode::KEY_NOT_FOUND.code(), 0, 0, &[], &[]);
        assert_eq!(decode_record(&msg).unwrap(), ReadOutcome::Absent);
    }

    #[test]
    fn test_decode_other_codes_are_database_errors() {
        for code in [1u8, 3, 9, 14, 22, 200, 255] {
            let msg = build_message(code, 0, 0, &[], &[]);
            let err = decode_record(&msg).unwrap_err();
            assert_eq!(err.result_code(), Some(ResultCode(code)));
        }
    }

    #[test]
    fn test_decode_skips_fields() {
        let msg = build_message(
            0,
            1,
            0,
            &[b"\x00test", b"\x01users", b""],
            &[("n", PARTICLE_INTEGER, &5i64.to_be_bytes())],
        );
        let record = found(decode_record(&msg).unwrap());
        assert_eq!(record.bin("n"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_decode_many_ops_with_edge_lengths() {
        let long_name = "n".repeat(255);
        let long_value = vec![b'v'; 4096];
        let names: Vec<String> = (0..50).map(|i| format!("bin{}", i)).collect();

        let mut ops: Vec<(&str, u8, &[u8])> = names
            .iter()
            .map(|name| (name.as_str(), PARTICLE_STRING, &b"x"[..]))
            .collect();
        ops.push(("", PARTICLE_STRING, b""));
        ops.push((long_name.as_str(), PARTICLE_STRING, &long_value));

        let msg = build_message(0, 1, 0, &[], &ops);
        let record = found(decode_record(&msg).unwrap());
        assert_eq!(record.bins.len(), 52);
        assert_eq!(record.bin(""), Some(&Value::Str(String::new())));
        assert_eq!(
            record.bin(&long_name),
            Some(&Value::Str(String::from_utf8(long_value).unwrap()))
        );
        assert_eq!(record.bin("bin49"), Some(&Value::Str("x".to_string())));
    }

    #[test]
    fn test_decode_duplicate_names_last_wins() {
        let msg = build_message(
            0,
            1,
            0,
            &[],
            &[("a", PARTICLE_STRING, b"first"), ("a", PARTICLE_STRING, b"second")],
        );
        let record = found(decode_record(&msg).unwrap());
        assert_eq!(record.bins.len(), 1);
        assert_eq!(record.bin("a"), Some(&Value::Str("second".to_string())));
    }

    #[test]
    fn test_decode_rejects_short_header() {
        let msg = build_message(0, 1, 0, &[], &[]);
        let err = decode_record(&msg[..10]).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn test_decode_rejects_truncated_op() {
        let msg = build_message(0, 1, 0, &[], &[("bin1", PARTICLE_STRING, b"hello")]);
        for cut in MSG_REMAINING_HEADER_SIZE..msg.len() {
            let err = decode_record(&msg[..cut]).unwrap_err();
            assert!(matches!(err, ClientError::Protocol(_)), "cut at {}", cut);
        }
    }

    #[test]
    fn test_decode_rejects_oversized_field_length() {
        let mut msg = build_message(0, 1, 0, &[b"abc"], &[]);
        let at = MSG_REMAINING_HEADER_SIZE;
        msg[at..at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(decode_record(&msg), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn test_decode_rejects_name_longer_than_op() {
        let mut msg = build_message(0, 1, 0, &[], &[("abcd", PARTICLE_STRING, b"")]);
        // Name length byte of the first op.
        msg[MSG_REMAINING_HEADER_SIZE + 7] = 200;
        assert!(matches!(decode_record(&msg), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut msg = build_message(0, 1, 0, &[], &[("a", PARTICLE_STRING, b"b")]);
        msg.push(0);
        assert!(matches!(decode_record(&msg), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn test_decode_header_rejects_bins() {
        let msg = build_message(0, 1, 0, &[], &[("a", PARTICLE_STRING, b"b")]);
        assert!(decode_header(&msg).is_err());

        let msg = build_message(0, 9, 5, &[], &[]);
        let record = found(decode_header(&msg).unwrap());
        assert_eq!(record.generation, 9);
    }

    #[test]
    fn test_buffer_grows_and_never_shrinks() {
        let mut buffer = ResponseBuffer::with_capacity(32);
        let big = build_message(0, 2, 0, &[], &[("big", PARTICLE_STRING, &[b'z'; 1000])]);
        let small = build_message(0, 3, 0, &[], &[("s", PARTICLE_STRING, b"t")]);

        let msg = buffer.fill_from(&big, big.len()).unwrap();
        let record = found(decode_record(msg).unwrap());
        assert_eq!(record.bin("big"), Some(&Value::Str("z".repeat(1000))));
        let grown = buffer.capacity();
        assert!(grown >= big.len());

        let msg = buffer.fill_from(&small, small.len()).unwrap();
        let record = found(decode_record(msg).unwrap());
        assert_eq!(record.generation, 3);
        assert_eq!(record.bin("s"), Some(&Value::Str("t".to_string())));
        assert_eq!(buffer.capacity(), grown);
    }

    #[test]
    fn test_fill_from_rejects_short_source() {
        let mut buffer = ResponseBuffer::new();
        assert!(buffer.fill_from(&[0u8; 10], 22).is_err());
    }

    #[test]
    fn test_message_mut_exposes_exact_size() {
        let mut buffer = ResponseBuffer::with_capacity(4);
        assert_eq!(buffer.message_mut(100).len(), 100);
        assert_eq!(buffer.capacity(), 100);
        assert_eq!(buffer.message(10).len(), 10);
    }
}

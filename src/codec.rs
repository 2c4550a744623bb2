//! Record/operation wire format.
//!
//! The teacher's WAL already frames each record as `[u32 length][bincode
//! bytes]`; this module lifts that framing into a reusable, self-delimiting
//! codec so it can also back Pager payloads, which are zero-padded at the
//! tail of a page chain (spec §9).

use crate::error::Result;
use bincode::Options;
use serde::{Deserialize, Serialize};

/// The reserved value marking a deletion (spec §3). Callers must never use
/// this byte string as a real value.
pub const TOMBSTONE: &[u8] = b"$tombstone";

fn opts() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

/// A single key/value pair as stored in an SSTable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value == TOMBSTONE
    }
}

/// The kind of a WAL/transaction operation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpKind {
    Put,
    Delete,
}

/// A tagged operation as appended to the write-ahead log.
///
/// Delete operations carry the tombstone marker as their value so
/// downstream layers (memtable, SSTable merges) treat Put and Delete
/// uniformly (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Operation {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            kind: OpKind::Put,
            key,
            value,
        }
    }

    pub fn delete(key: Vec<u8>) -> Self {
        Self {
            kind: OpKind::Delete,
            key,
            value: TOMBSTONE.to_vec(),
        }
    }

    pub fn into_record(self) -> Record {
        Record {
            key: self.key,
            value: self.value,
        }
    }
}

/// Encodes a value as `[u32 little-endian length][bincode bytes]`.
fn frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = opts().serialize(value)?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a value framed by [`frame`], ignoring any trailing bytes (page
/// zero-padding).
fn unframe<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    if data.len() < 4 {
        return Err(crate::error::LsmError::CorruptData(
            "frame shorter than length prefix".to_string(),
        ));
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let end = 4 + len;
    if end > data.len() {
        return Err(crate::error::LsmError::CorruptData(
            "frame length exceeds available data".to_string(),
        ));
    }
    Ok(opts().deserialize(&data[4..end])?)
}

pub fn encode_record(record: &Record) -> Result<Vec<u8>> {
    frame(record)
}

pub fn decode_record(data: &[u8]) -> Result<Record> {
    unframe(data)
}

pub fn encode_op(op: &Operation) -> Result<Vec<u8>> {
    frame(op)
}

pub fn decode_op(data: &[u8]) -> Result<Operation> {
    unframe(data)
}

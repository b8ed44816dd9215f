//! Read interface of the external change-log and the record envelope carried
//! in each log entry.

mod memory;

pub use memory::InMemoryChangeLog;

use crate::error::Result;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const TAG_PUT: u8 = 0x01;
const TAG_DELETE: u8 = 0x02;

/// One raw entry of a log partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub offset: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Put(Bytes),
    Delete,
}

/// Decoded mutation at a log offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub offset: u64,
    pub key: Bytes,
    pub operation: Operation,
}

#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Opens a cursor positioned at `from_offset`.
    async fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
    ) -> Result<Box<dyn LogSubscription>>;

    /// Offset the next appended entry will get.
    async fn end_offset(&self, topic: &str, partition: u32) -> Result<u64>;
}

#[async_trait]
pub trait LogSubscription: Send {
    /// Returns up to `max_records` entries in log order; empty when caught up.
    async fn poll(&mut self, max_records: usize) -> Result<Vec<LogEntry>>;

    /// Offset of the next entry `poll` will return.
    fn position(&self) -> u64;
}

pub fn encode_put(key: &[u8], value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(9 + key.len() + value.len());
    buf.put_u8(TAG_PUT);
    buf.put_u32(key.len() as u32);
    buf.put_slice(key);
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
    buf.freeze()
}

pub fn encode_delete(key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + key.len());
    buf.put_u8(TAG_DELETE);
    buf.put_u32(key.len() as u32);
    buf.put_slice(key);
    buf.freeze()
}

/// Decodes the payload of `entry`. The returned error carries only the reason;
/// callers attach the partition.
pub fn decode_record(entry: &LogEntry) -> std::result::Result<ChangeRecord, String> {
    let mut buf = entry.payload.clone();

    if !buf.has_remaining() {
        return Err("empty payload".to_string());
    }
    let tag = buf.get_u8();
    let key = read_chunk(&mut buf, "key")?;

    let operation = match tag {
        TAG_PUT => Operation::Put(read_chunk(&mut buf, "value")?),
        TAG_DELETE => Operation::Delete,
        other => return Err(format!("unknown operation tag 0x{:02x}", other)),
    };

    if buf.has_remaining() {
        return Err(format!("{} trailing bytes", buf.remaining()));
    }

    Ok(ChangeRecord {
        offset: entry.offset,
        key,
        operation,
    })
}

fn read_chunk(buf: &mut Bytes, what: &str) -> std::result::Result<Bytes, String> {
    if buf.remaining() < 4 {
        return Err(format!("truncated {} length", what));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        ));
    }
    Ok(buf.split_to(len))
}

impl ChangeRecord {
    pub fn encode(&self) -> Bytes {
        match &self.operation {
            Operation::Put(value) => encode_put(&self.key, value),
            Operation::Delete => encode_delete(&self.key),
        }
    }
}

//! Backup key-value records and record batches.
//!
//! ## Record wire layout (little-endian)
//!
//! ```text
//! key (u32 len + bytes)
//! value (u32 len + bytes)
//! user_meta (u8 len + bytes)   — exactly one byte for well-formed records
//! version: u64
//! stream_id: u32
//! ```
//!
//! A batch ([`KvList`]) is `count u32` followed by `count` length-prefixed
//! records. Archives store batches behind a `u64 LE` size frame; map files
//! store single records behind a varint frame. Both reuse this layout.

use crate::error::{Error, Result};
use crate::wire::{read_bytes, read_u32, read_u64, read_u8};

/// `user_meta` bit: the value is a schema or type update.
pub const BIT_SCHEMA_POSTING: u8 = 0x01;
/// `user_meta` bit: the value is a delta posting list.
pub const BIT_DELTA_POSTING: u8 = 0x04;
/// `user_meta` bit: the value is a complete posting list.
pub const BIT_COMPLETE_POSTING: u8 = 0x08;
/// `user_meta` bit: the posting list is empty and the value is absent.
pub const BIT_EMPTY_POSTING: u8 = 0x10;

/// One key-value record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Kv {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Record kind marker; exactly one byte on well-formed records.
    pub user_meta: Vec<u8>,
    pub version: u64,
    pub stream_id: u32,
}

impl Kv {
    /// Serialized size in bytes.
    pub fn marshalled_len(&self) -> usize {
        4 + self.key.len() + 4 + self.value.len() + 1 + self.user_meta.len() + 8 + 4
    }

    /// Append the wire form to `buf`.
    pub fn marshal_into(&self, buf: &mut Vec<u8>) {
        debug_assert!(self.key.len() <= u32::MAX as usize);
        debug_assert!(self.user_meta.len() <= u8::MAX as usize);
        buf.reserve(self.marshalled_len());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.value);
        buf.push(self.user_meta.len() as u8);
        buf.extend_from_slice(&self.user_meta);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.stream_id.to_le_bytes());
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.marshalled_len());
        self.marshal_into(&mut buf);
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let kv = Self::read_from(data, &mut pos)?;
        if pos != data.len() {
            return Err(Error::decode("trailing bytes after kv record"));
        }
        Ok(kv)
    }

    fn read_from(data: &[u8], pos: &mut usize) -> Result<Self> {
        let key_len = read_u32(data, pos)? as usize;
        let key = read_bytes(data, pos, key_len)?.to_vec();
        let value_len = read_u32(data, pos)? as usize;
        let value = read_bytes(data, pos, value_len)?.to_vec();
        let meta_len = read_u8(data, pos)? as usize;
        let user_meta = read_bytes(data, pos, meta_len)?.to_vec();
        let version = read_u64(data, pos)?;
        let stream_id = read_u32(data, pos)?;
        Ok(Kv {
            key,
            value,
            user_meta,
            version,
            stream_id,
        })
    }
}

/// A batch of records as stored in one archive frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KvList {
    pub kvs: Vec<Kv>,
}

impl KvList {
    pub fn marshal(&self) -> Vec<u8> {
        debug_assert!(self.kvs.len() <= u32::MAX as usize);
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.kvs.len() as u32).to_le_bytes());
        for kv in &self.kvs {
            buf.extend_from_slice(&(kv.marshalled_len() as u32).to_le_bytes());
            kv.marshal_into(&mut buf);
        }
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let count = read_u32(data, &mut pos)? as usize;
        let mut kvs = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let len = read_u32(data, &mut pos)? as usize;
            let record = read_bytes(data, &mut pos, len)?;
            kvs.push(Kv::unmarshal(record)?);
        }
        if pos != data.len() {
            return Err(Error::decode("trailing bytes after kv list"));
        }
        Ok(KvList { kvs })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_kv(version: u64) -> Kv {
        Kv {
            key: vec![1, 2, 3],
            value: vec![9; 17],
            user_meta: vec![BIT_COMPLETE_POSTING],
            version,
            stream_id: 0,
        }
    }

    #[test]
    fn test_kv_round_trip() {
        let kv = sample_kv(42);
        let buf = kv.marshal();
        assert_eq!(buf.len(), kv.marshalled_len());
        assert_eq!(Kv::unmarshal(&buf).unwrap(), kv);
    }

    #[test]
    fn test_kv_rejects_truncation() {
        let buf = sample_kv(42).marshal();
        assert!(Kv::unmarshal(&buf[..buf.len() - 1]).is_err());
        assert!(Kv::unmarshal(&[]).is_err());
    }

    #[test]
    fn test_kv_list_round_trip() {
        let list = KvList {
            kvs: vec![sample_kv(1), sample_kv(2), sample_kv(3)],
        };
        assert_eq!(KvList::unmarshal(&list.marshal()).unwrap(), list);

        let empty = KvList::default();
        assert_eq!(KvList::unmarshal(&empty.marshal()).unwrap(), empty);
    }
}

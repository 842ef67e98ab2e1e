//! Map files: the sorted, partitioned output artifact of the map phase.
//!
//! ## Entry framing
//!
//! ```text
//! [key_len u16 BE] [key bytes] [marshalled kv bytes]
//! ```
//!
//! The key is the native key plus the [`key_with_ts`] timestamp suffix; it
//! is stored alongside the record so the sort and the downstream merge can
//! compare keys without unmarshalling.
//!
//! ## File format
//!
//! ```text
//! [header_len u32 BE] [marshalled MapHeader]
//! repeated: [varint entry_len] [entry bytes]
//! ```
//!
//! The whole file is written through a snappy frame encoder and fsynced
//! before the writer slot is released. The header lists partition keys: a
//! sorted sample of entry keys taken every ~`partition_buf_sz` bytes, which
//! the reduce phase uses to shard the file without reading all of it.
//!
//! [`key_with_ts`]: quiver_db_core::key_with_ts

use crate::buffer::SliceBuffer;
use crate::error::{RestoreError, Result};
use quiver_db_core::wire::{decode_varint, encode_varint, read_bytes, read_u32};
use quiver_db_core::Kv;
use snap::read::FrameDecoder;
use snap::write::FrameEncoder;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::Path;

/// Key of a framed map entry.
pub fn entry_key(entry: &[u8]) -> &[u8] {
    debug_assert!(entry.len() >= 2);
    let sz = u16::from_be_bytes([entry[0], entry[1]]) as usize;
    &entry[2..2 + sz]
}

/// Marshalled record of a framed map entry.
pub fn entry_data(entry: &[u8]) -> &[u8] {
    debug_assert!(entry.len() >= 2);
    let sz = u16::from_be_bytes([entry[0], entry[1]]) as usize;
    &entry[2 + sz..]
}

/// Frame `(key, kv)` into `out` (cleared first).
pub(crate) fn encode_entry(key: &[u8], kv: &Kv, out: &mut Vec<u8>) {
    debug_assert!(key.len() <= u16::MAX as usize);
    out.clear();
    out.reserve(2 + key.len() + kv.marshalled_len());
    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
    out.extend_from_slice(key);
    kv.marshal_into(out);
}

/// Map file header: the partition key sample.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MapHeader {
    pub partition_keys: Vec<Vec<u8>>,
}

impl MapHeader {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.partition_keys.len() as u32).to_le_bytes());
        for key in &self.partition_keys {
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key);
        }
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let count = read_u32(data, &mut pos)? as usize;
        let mut partition_keys = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let len = read_u32(data, &mut pos)? as usize;
            partition_keys.push(read_bytes(data, &mut pos, len)?.to_vec());
        }
        if pos != data.len() {
            return Err(RestoreError::decode("trailing bytes after map header"));
        }
        Ok(MapHeader { partition_keys })
    }
}

/// Sample partition keys from a sorted entry buffer.
///
/// Walks the entries accumulating framed length; every `partition_buf_sz`
/// bytes the current entry's key becomes a partition key, unless it would
/// duplicate the previous one (duplicate runs collapse, keeping the header
/// strictly ascending).
fn partition_keys(buf: &SliceBuffer, partition_buf_sz: usize) -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = Vec::new();
    let mut buf_size = 0usize;
    for entry in buf.iter() {
        buf_size += 4 + entry.len();
        if buf_size < partition_buf_sz {
            continue;
        }
        let key = entry_key(entry);
        if keys.last().is_some_and(|prev| prev.as_slice() == key) {
            continue;
        }
        keys.push(key.to_vec());
        buf_size = 0;
    }
    keys
}

/// Write one sorted entry buffer as a map file at `path`.
///
/// Returns the on-disk (compressed) size. The file is durable before this
/// returns.
pub(crate) fn write_map_file(
    path: &Path,
    buf: &SliceBuffer,
    partition_buf_sz: usize,
) -> Result<u64> {
    let header = MapHeader {
        partition_keys: partition_keys(buf, partition_buf_sz),
    };
    let header_bytes = header.marshal();

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    {
        let mut w = FrameEncoder::new(&file);
        w.write_all(&(header_bytes.len() as u32).to_be_bytes())?;
        w.write_all(&header_bytes)?;

        let mut len_buf = Vec::with_capacity(10);
        for entry in buf.iter() {
            len_buf.clear();
            encode_varint(entry.len() as u64, &mut len_buf);
            w.write_all(&len_buf)?;
            w.write_all(entry)?;
        }
        w.flush()?;
    }
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Decode a map file back into its header and entries.
///
/// Verification/debugging helper; the reduce phase has its own streaming
/// reader.
pub fn read_map_file(path: &Path) -> Result<(MapHeader, Vec<Vec<u8>>)> {
    let mut r = FrameDecoder::new(BufReader::new(File::open(path)?));
    let mut raw = Vec::new();
    r.read_to_end(&mut raw)?;

    if raw.len() < 4 {
        return Err(RestoreError::decode("map file too short for a header"));
    }
    let header_len = u32::from_be_bytes(raw[..4].try_into().unwrap()) as usize;
    let mut pos = 4;
    let header = MapHeader::unmarshal(read_bytes(&raw, &mut pos, header_len)?)?;

    let mut entries = Vec::new();
    while pos < raw.len() {
        let len = decode_varint(&raw, &mut pos)
            .map_err(|e| RestoreError::decode(format!("map entry frame: {e}")))? as usize;
        entries.push(read_bytes(&raw, &mut pos, len)?.to_vec());
    }
    Ok((header, entries))
}

// ============================================================================
// Tests
// ============================================================================

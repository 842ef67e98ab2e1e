//! Posting lists: backup form, packed native form, and rollup.
//!
//! Backups store a posting list as a plain sorted uid vector plus postings
//! that carry values. The native form packs uids into delta-varint blocks so
//! large lists stay compact on disk. A complete list whose packed size grows
//! past [`MAX_LIST_SIZE`] is rolled up into one primary record holding split
//! start-uids plus one record per split.

use crate::error::{Error, Result};
use crate::keys::split_key;
use crate::kv::{Kv, BIT_COMPLETE_POSTING, BIT_EMPTY_POSTING};
use crate::wire::{
    decode_varint, encode_varint, read_bytes, read_u32, read_u64, read_u8, varint_len,
};

/// Uids per pack block.
pub const BLOCK_SIZE: usize = 256;

/// Marshalled size past which a complete posting list is split on rollup.
pub const MAX_LIST_SIZE: usize = (1 << 20) / 2;

/// Size budget for each split produced by [`rollup`].
const SPLIT_TARGET: usize = MAX_LIST_SIZE / 2;

/// One posting: a uid plus an optional typed value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Posting {
    pub uid: u64,
    pub value_type: u8,
    pub value: Vec<u8>,
}

impl Posting {
    fn marshalled_len(&self) -> usize {
        8 + 1 + 4 + self.value.len()
    }

    fn marshal_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.push(self.value_type);
        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.value);
    }

    fn read_from(data: &[u8], pos: &mut usize) -> Result<Self> {
        let uid = read_u64(data, pos)?;
        let value_type = read_u8(data, pos)?;
        let len = read_u32(data, pos)? as usize;
        let value = read_bytes(data, pos, len)?.to_vec();
        Ok(Posting {
            uid,
            value_type,
            value,
        })
    }
}

/// One delta-varint block of a [`UidPack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidBlock {
    /// First uid of the block, stored raw.
    pub base: u64,
    /// Uids in the block, including the base.
    pub num: u32,
    /// Varint deltas for the uids after the base.
    pub deltas: Vec<u8>,
}

impl UidBlock {
    fn marshalled_len(&self) -> usize {
        8 + 4 + 4 + self.deltas.len()
    }
}

/// Delta-varint packed uid set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidPack {
    pub block_size: u32,
    pub blocks: Vec<UidBlock>,
}

impl UidPack {
    pub fn empty() -> Self {
        UidPack {
            block_size: BLOCK_SIZE as u32,
            blocks: Vec::new(),
        }
    }

    /// Pack a sorted uid slice.
    pub fn from_uids(uids: &[u64]) -> Self {
        let mut pack = UidPack::empty();
        for chunk in uids.chunks(BLOCK_SIZE) {
            let base = chunk[0];
            let mut deltas = Vec::with_capacity(chunk.len());
            let mut prev = base;
            for &uid in &chunk[1..] {
                encode_varint(uid.wrapping_sub(prev), &mut deltas);
                prev = uid;
            }
            pack.blocks.push(UidBlock {
                base,
                num: chunk.len() as u32,
                deltas,
            });
        }
        pack
    }

    /// Decode back into a flat uid vector.
    pub fn uids(&self) -> Result<Vec<u64>> {
        let mut out = Vec::with_capacity(self.num_uids());
        for block in &self.blocks {
            let mut uid = block.base;
            out.push(uid);
            let mut pos = 0;
            for _ in 1..block.num {
                let delta = decode_varint(&block.deltas, &mut pos)
                    .map_err(|e| Error::decode(format!("uid pack block: {e}")))?;
                uid = uid.wrapping_add(delta);
                out.push(uid);
            }
            if pos != block.deltas.len() {
                return Err(Error::decode("trailing bytes in uid pack block"));
            }
        }
        Ok(out)
    }

    pub fn num_uids(&self) -> usize {
        self.blocks.iter().map(|b| b.num as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn marshalled_len(&self) -> usize {
        4 + 4 + self.blocks.iter().map(UidBlock::marshalled_len).sum::<usize>()
    }
}

impl Default for UidPack {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Backup form
// ============================================================================

/// Posting list as serialized in backup archives: plain sorted uids.
///
/// Wire layout (little-endian): `uids (u32 count + u64 each) | postings
/// (u32 count + records) | commit_ts u64 | splits (u32 count + u64 each)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackupPostingList {
    pub uids: Vec<u64>,
    pub postings: Vec<Posting>,
    pub commit_ts: u64,
    pub splits: Vec<u64>,
}

impl BackupPostingList {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.uids.len() as u32).to_le_bytes());
        for uid in &self.uids {
            buf.extend_from_slice(&uid.to_le_bytes());
        }
        buf.extend_from_slice(&(self.postings.len() as u32).to_le_bytes());
        for p in &self.postings {
            p.marshal_into(&mut buf);
        }
        buf.extend_from_slice(&self.commit_ts.to_le_bytes());
        buf.extend_from_slice(&(self.splits.len() as u32).to_le_bytes());
        for s in &self.splits {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let uid_count = read_u32(data, &mut pos)? as usize;
        let mut uids = Vec::with_capacity(uid_count.min(1 << 20));
        for _ in 0..uid_count {
            uids.push(read_u64(data, &mut pos)?);
        }
        let posting_count = read_u32(data, &mut pos)? as usize;
        let mut postings = Vec::with_capacity(posting_count.min(1 << 16));
        for _ in 0..posting_count {
            postings.push(Posting::read_from(data, &mut pos)?);
        }
        let commit_ts = read_u64(data, &mut pos)?;
        let split_count = read_u32(data, &mut pos)? as usize;
        let mut splits = Vec::with_capacity(split_count.min(1 << 10));
        for _ in 0..split_count {
            splits.push(read_u64(data, &mut pos)?);
        }
        if pos != data.len() {
            return Err(Error::decode("trailing bytes after backup posting list"));
        }
        Ok(BackupPostingList {
            uids,
            postings,
            commit_ts,
            splits,
        })
    }
}

// ============================================================================
// Native form
// ============================================================================

/// Posting list in the native packed form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostingList {
    pub pack: UidPack,
    pub postings: Vec<Posting>,
    pub commit_ts: u64,
    /// Start uids of the splits of a multi-part list; empty otherwise.
    pub splits: Vec<u64>,
}

impl PostingList {
    /// Convert the backup form, packing the uid vector.
    pub fn from_backup(bpl: &BackupPostingList) -> Self {
        PostingList {
            pack: UidPack::from_uids(&bpl.uids),
            postings: bpl.postings.clone(),
            commit_ts: bpl.commit_ts,
            splits: bpl.splits.clone(),
        }
    }

    /// Serialized size in bytes, without serializing.
    pub fn marshalled_len(&self) -> usize {
        self.pack.marshalled_len()
            + 4
            + self.postings.iter().map(Posting::marshalled_len).sum::<usize>()
            + 8
            + 4
            + 8 * self.splits.len()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.marshalled_len());
        buf.extend_from_slice(&self.pack.block_size.to_le_bytes());
        buf.extend_from_slice(&(self.pack.blocks.len() as u32).to_le_bytes());
        for block in &self.pack.blocks {
            buf.extend_from_slice(&block.base.to_le_bytes());
            buf.extend_from_slice(&block.num.to_le_bytes());
            buf.extend_from_slice(&(block.deltas.len() as u32).to_le_bytes());
            buf.extend_from_slice(&block.deltas);
        }
        buf.extend_from_slice(&(self.postings.len() as u32).to_le_bytes());
        for p in &self.postings {
            p.marshal_into(&mut buf);
        }
        buf.extend_from_slice(&self.commit_ts.to_le_bytes());
        buf.extend_from_slice(&(self.splits.len() as u32).to_le_bytes());
        for s in &self.splits {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let block_size = read_u32(data, &mut pos)?;
        let block_count = read_u32(data, &mut pos)? as usize;
        let mut blocks = Vec::with_capacity(block_count.min(1 << 16));
        for _ in 0..block_count {
            let base = read_u64(data, &mut pos)?;
            let num = read_u32(data, &mut pos)?;
            let deltas_len = read_u32(data, &mut pos)? as usize;
            let deltas = read_bytes(data, &mut pos, deltas_len)?.to_vec();
            blocks.push(UidBlock { base, num, deltas });
        }
        let posting_count = read_u32(data, &mut pos)? as usize;
        let mut postings = Vec::with_capacity(posting_count.min(1 << 16));
        for _ in 0..posting_count {
            postings.push(Posting::read_from(data, &mut pos)?);
        }
        let commit_ts = read_u64(data, &mut pos)?;
        let split_count = read_u32(data, &mut pos)? as usize;
        let mut splits = Vec::with_capacity(split_count.min(1 << 10));
        for _ in 0..split_count {
            splits.push(read_u64(data, &mut pos)?);
        }
        if pos != data.len() {
            return Err(Error::decode("trailing bytes after posting list"));
        }
        Ok(PostingList {
            pack: UidPack { block_size, blocks },
            postings,
            commit_ts,
            splits,
        })
    }

    fn is_plist_empty(&self) -> bool {
        self.pack.is_empty() && self.postings.is_empty() && self.splits.is_empty()
    }
}

/// Marshal a posting list into a record value, returning `(value, meta)`.
///
/// An empty list is encoded as an absent value with the empty-posting meta.
pub fn marshal_posting_list(pl: &PostingList) -> (Vec<u8>, u8) {
    if pl.is_plist_empty() {
        (Vec::new(), BIT_EMPTY_POSTING)
    } else {
        (pl.marshal(), BIT_COMPLETE_POSTING)
    }
}

/// Whether a complete list is large enough to be split on rollup.
pub fn should_split(pl: &PostingList) -> bool {
    pl.marshalled_len() >= MAX_LIST_SIZE && pl.pack.blocks.len() > 1
}

// ============================================================================
// Rollup
// ============================================================================

fn part_to_kv(key: Vec<u8>, pl: &PostingList) -> Kv {
    let (value, meta) = marshal_posting_list(pl);
    Kv {
        key,
        value,
        user_meta: vec![meta],
        version: pl.commit_ts,
        stream_id: 0,
    }
}

/// Roll a complete posting list up into its canonical record set.
///
/// Returns a single record when the list fits in one part; otherwise one
/// primary record carrying the split start-uids plus one record per split,
/// each keyed by [`split_key`]. `key` must be the unsplit native data key.
/// Postings must be sorted by uid.
pub fn rollup(key: &[u8], pl: PostingList) -> Result<Vec<Kv>> {
    if !should_split(&pl) {
        return Ok(vec![part_to_kv(key.to_vec(), &pl)]);
    }

    let commit_ts = pl.commit_ts;
    let uids = pl.pack.uids()?;
    let mut postings = pl.postings.into_iter().peekable();

    // Greedy size-bounded partition of the uid space. Postings ride along
    // with the part that holds their uid.
    let mut parts: Vec<(Vec<u64>, Vec<Posting>)> = Vec::new();
    let mut cur_uids: Vec<u64> = Vec::new();
    let mut cur_postings: Vec<Posting> = Vec::new();
    let mut cur_bytes = 0usize;
    for (i, &uid) in uids.iter().enumerate() {
        let mut sz = if cur_uids.is_empty() {
            8
        } else {
            varint_len(uid.wrapping_sub(*cur_uids.last().unwrap()))
        };
        while let Some(p) = postings.peek() {
            if p.uid > uid {
                break;
            }
            let p = postings.next().unwrap();
            sz += p.marshalled_len();
            cur_postings.push(p);
        }
        cur_uids.push(uid);
        cur_bytes += sz;

        if cur_bytes >= SPLIT_TARGET && i + 1 < uids.len() {
            parts.push((std::mem::take(&mut cur_uids), std::mem::take(&mut cur_postings)));
            cur_bytes = 0;
        }
    }
    if !cur_uids.is_empty() || !cur_postings.is_empty() {
        parts.push((cur_uids, cur_postings));
    }

    let make_part = |uids: &[u64], postings: Vec<Posting>| PostingList {
        pack: UidPack::from_uids(uids),
        postings,
        commit_ts,
        splits: Vec::new(),
    };

    if parts.len() <= 1 {
        let (uids, postings) = parts.pop().unwrap_or_default();
        return Ok(vec![part_to_kv(key.to_vec(), &make_part(&uids, postings))]);
    }

    let starts: Vec<u64> = parts.iter().map(|(uids, _)| uids[0]).collect();
    let mut kvs = Vec::with_capacity(parts.len() + 1);
    kvs.push(part_to_kv(
        key.to_vec(),
        &PostingList {
            pack: UidPack::empty(),
            postings: Vec::new(),
            commit_ts,
            splits: starts.clone(),
        },
    ));
    for (start, (uids, postings)) in starts.iter().zip(parts) {
        kvs.push(part_to_kv(
            split_key(key, *start)?,
            &make_part(&uids, postings),
        ));
    }
    Ok(kvs)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::namespace_attr;
    use crate::keys::{data_key, parse_key};

    #[test]
    fn test_uid_pack_round_trip() {
        for uids in [
            vec![],
            vec![7u64],
            (0..1000u64).map(|i| i * 3 + 1).collect::<Vec<_>>(),
            vec![1, 2, u64::MAX - 1, u64::MAX],
        ] {
            let pack = UidPack::from_uids(&uids);
            assert_eq!(pack.uids().unwrap(), uids);
            assert_eq!(pack.num_uids(), uids.len());
        }
    }

    #[test]
    fn test_uid_pack_block_boundaries() {
        let uids: Vec<u64> = (0..=BLOCK_SIZE as u64).collect();
        let pack = UidPack::from_uids(&uids);
        assert_eq!(pack.blocks.len(), 2);
        assert_eq!(pack.blocks[1].base, BLOCK_SIZE as u64);
        assert_eq!(pack.uids().unwrap(), uids);
    }

    #[test]
    fn test_backup_posting_list_round_trip() {
        let bpl = BackupPostingList {
            uids: vec![1, 5, 9],
            postings: vec![Posting {
                uid: 5,
                value_type: 2,
                value: b"hello".to_vec(),
            }],
            commit_ts: 40,
            splits: vec![],
        };
        assert_eq!(
            BackupPostingList::unmarshal(&bpl.marshal()).unwrap(),
            bpl
        );
    }

    #[test]
    fn test_posting_list_round_trip_and_size() {
        let pl = PostingList::from_backup(&BackupPostingList {
            uids: (0..600u64).collect(),
            postings: vec![Posting {
                uid: 3,
                value_type: 1,
                value: vec![0xab; 32],
            }],
            commit_ts: 7,
            splits: vec![],
        });
        let buf = pl.marshal();
        assert_eq!(buf.len(), pl.marshalled_len());
        assert_eq!(PostingList::unmarshal(&buf).unwrap(), pl);
    }

    #[test]
    fn test_marshal_empty_list() {
        let (value, meta) = marshal_posting_list(&PostingList::default());
        assert!(value.is_empty());
        assert_eq!(meta, BIT_EMPTY_POSTING);
    }

    #[test]
    fn test_small_list_does_not_split() {
        let pl = PostingList::from_backup(&BackupPostingList {
            uids: (0..1000u64).collect(),
            postings: vec![],
            commit_ts: 1,
            splits: vec![],
        });
        assert!(!should_split(&pl));

        let key = data_key(&namespace_attr(1, "follows"), 9);
        let kvs = rollup(&key, pl).unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].key, key);
        assert_eq!(kvs[0].user_meta, vec![BIT_COMPLETE_POSTING]);
    }

    fn big_list(commit_ts: u64) -> PostingList {
        // ~700 KiB of posting values spread over >1 block of uids.
        let uids: Vec<u64> = (0..700u64).collect();
        let postings: Vec<Posting> = uids
            .iter()
            .map(|&uid| Posting {
                uid,
                value_type: 1,
                value: vec![0x5a; 1024],
            })
            .collect();
        PostingList::from_backup(&BackupPostingList {
            uids,
            postings,
            commit_ts,
            splits: vec![],
        })
    }

    #[test]
    fn test_rollup_splits_large_list() {
        let key = data_key(&namespace_attr(1, "follows"), 9);
        let pl = big_list(88);
        assert!(should_split(&pl));

        let kvs = rollup(&key, pl).unwrap();
        assert!(kvs.len() > 2, "expected primary + splits, got {}", kvs.len());

        // Primary record: original key, carries the split start uids.
        let primary = PostingList::unmarshal(&kvs[0].value).unwrap();
        assert_eq!(kvs[0].key, key);
        assert_eq!(primary.splits.len(), kvs.len() - 1);
        assert!(primary.pack.is_empty());

        // Split records: split keys in start-uid order, partitioning the uids.
        let mut all_uids = Vec::new();
        for (kv, &start) in kvs[1..].iter().zip(&primary.splits) {
            let parsed = parse_key(&kv.key).unwrap();
            assert!(parsed.has_start_uid);
            assert_eq!(parsed.start_uid, start);
            assert_eq!(kv.version, 88);
            let part = PostingList::unmarshal(&kv.value).unwrap();
            let uids = part.pack.uids().unwrap();
            assert_eq!(uids[0], start);
            all_uids.extend(uids);
        }
        assert_eq!(all_uids, (0..700u64).collect::<Vec<_>>());

        // Every posting landed in exactly one split.
        let total: usize = kvs[1..]
            .iter()
            .map(|kv| PostingList::unmarshal(&kv.value).unwrap().postings.len())
            .sum();
        assert_eq!(total, 700);
    }
}

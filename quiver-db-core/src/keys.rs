//! Native key encoding, parsing, and ordering.
//!
//! ## Native key layout (bytewise-sortable)
//!
//! ```text
//! [plane u8] [attr_len u16 BE] [attr utf8] [rest…]
//!
//! plane 0x00 (data plane):
//!   [kind u8] [payload]
//!     DATA / REVERSE      → uid u64 BE
//!     COUNT / COUNT_REV   → count u32 BE
//!     INDEX               → term bytes
//!   A DATA key may carry the SPLIT flag (bit 0), in which case the uid
//!   payload is followed by start_uid u64 BE — one part of a multi-part
//!   posting list.
//! plane 0x01: schema key (no payload)
//! plane 0x02: type key (no payload)
//! ```
//!
//! `attr` is always the namespaced `<ns hex>-<name>` form; see [`crate::attr`].
//!
//! ## Timestamp suffix
//!
//! Keys headed into the sort carry an extra `u64 BE` timestamp segment
//! appended by [`key_with_ts`]. [`compare_keys`] orders by the key prefix
//! first and the suffix second, so two versions of the same key stay
//! adjacent and ordered.

use crate::attr::{namespace_attr, parse_namespace_attr};
use crate::error::{Error, Result};
use std::cmp::Ordering;

const PLANE_DATA: u8 = 0x00;
const PLANE_SCHEMA: u8 = 0x01;
const PLANE_TYPE: u8 = 0x02;

const KIND_DATA: u8 = 0x00;
const KIND_INDEX: u8 = 0x02;
const KIND_REVERSE: u8 = 0x04;
const KIND_COUNT: u8 = 0x08;
const KIND_COUNT_REV: u8 = 0x0c;

/// Bit 0 of the kind byte marks one part of a multi-part posting list.
const SPLIT_FLAG: u8 = 0x01;

/// Length of the timestamp suffix appended by [`key_with_ts`].
pub const TS_SUFFIX_LEN: usize = 8;

/// What a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// A posting list for `(attr, uid)`.
    Data,
    /// A term index entry for `attr`.
    Index,
    /// A reverse-edge posting list for `(attr, uid)`.
    Reverse,
    /// A count index entry for `attr`.
    Count,
    /// A reverse count index entry for `attr`.
    CountRev,
    /// The schema record for a predicate.
    Schema,
    /// The type record for a type name.
    Type,
}

impl KeyKind {
    /// Tag used in the backup key wire format.
    fn wire_tag(self) -> u8 {
        match self {
            KeyKind::Data => 0,
            KeyKind::Index => 1,
            KeyKind::Reverse => 2,
            KeyKind::Count => 3,
            KeyKind::CountRev => 4,
            KeyKind::Schema => 5,
            KeyKind::Type => 6,
        }
    }

    fn from_wire_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => KeyKind::Data,
            1 => KeyKind::Index,
            2 => KeyKind::Reverse,
            3 => KeyKind::Count,
            4 => KeyKind::CountRev,
            5 => KeyKind::Schema,
            6 => KeyKind::Type,
            other => return Err(Error::malformed_key(format!("unknown key kind tag {other}"))),
        })
    }
}

/// A decoded native key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    /// Tenant namespace, taken from the attribute prefix.
    pub namespace: u64,
    /// Namespaced attribute (`<ns hex>-<name>`).
    pub attr: String,
    pub kind: KeyKind,
    /// Subject uid for data/reverse keys, zero otherwise.
    pub uid: u64,
    /// First uid of this part for split keys, zero otherwise.
    pub start_uid: u64,
    /// Index term for index keys, empty otherwise.
    pub term: Vec<u8>,
    /// Count for count keys, zero otherwise.
    pub count: u32,
    /// True when the key addresses one part of a multi-part list.
    pub has_start_uid: bool,
}

impl ParsedKey {
    pub fn is_schema(&self) -> bool {
        self.kind == KeyKind::Schema
    }

    pub fn is_type(&self) -> bool {
        self.kind == KeyKind::Type
    }

    pub fn is_data(&self) -> bool {
        self.kind == KeyKind::Data
    }
}

// ============================================================================
// Builders
// ============================================================================

fn key_prefix(plane: u8, attr: &str, extra: usize) -> Vec<u8> {
    debug_assert!(attr.len() <= u16::MAX as usize);
    let mut key = Vec::with_capacity(3 + attr.len() + extra);
    key.push(plane);
    key.extend_from_slice(&(attr.len() as u16).to_be_bytes());
    key.extend_from_slice(attr.as_bytes());
    key
}

/// Key of the posting list for `(attr, uid)`.
pub fn data_key(attr: &str, uid: u64) -> Vec<u8> {
    let mut key = key_prefix(PLANE_DATA, attr, 9);
    key.push(KIND_DATA);
    key.extend_from_slice(&uid.to_be_bytes());
    key
}

/// Key of the reverse-edge posting list for `(attr, uid)`.
pub fn reverse_key(attr: &str, uid: u64) -> Vec<u8> {
    let mut key = key_prefix(PLANE_DATA, attr, 9);
    key.push(KIND_REVERSE);
    key.extend_from_slice(&uid.to_be_bytes());
    key
}

/// Key of the term index entry `(attr, term)`.
pub fn index_key(attr: &str, term: &[u8]) -> Vec<u8> {
    let mut key = key_prefix(PLANE_DATA, attr, 1 + term.len());
    key.push(KIND_INDEX);
    key.extend_from_slice(term);
    key
}

/// Key of the count index entry `(attr, count)`.
pub fn count_key(attr: &str, count: u32, reverse: bool) -> Vec<u8> {
    let mut key = key_prefix(PLANE_DATA, attr, 5);
    key.push(if reverse { KIND_COUNT_REV } else { KIND_COUNT });
    key.extend_from_slice(&count.to_be_bytes());
    key
}

/// Key of the schema record for `attr`.
pub fn schema_key(attr: &str) -> Vec<u8> {
    key_prefix(PLANE_SCHEMA, attr, 0)
}

/// Key of the type record for `attr`.
pub fn type_key(attr: &str) -> Vec<u8> {
    key_prefix(PLANE_TYPE, attr, 0)
}

/// Derive the key of one part of a multi-part posting list.
///
/// Only unsplit data keys can be split further.
pub fn split_key(key: &[u8], start_uid: u64) -> Result<Vec<u8>> {
    let parsed = parse_key(key)?;
    if !parsed.is_data() || parsed.has_start_uid {
        return Err(Error::malformed_key(
            "split keys can only be derived from unsplit data keys",
        ));
    }
    let kind_at = 3 + parsed.attr.len();
    let mut out = Vec::with_capacity(key.len() + 8);
    out.extend_from_slice(key);
    out[kind_at] |= SPLIT_FLAG;
    out.extend_from_slice(&start_uid.to_be_bytes());
    Ok(out)
}

// ============================================================================
// Parsing
// ============================================================================

fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize, what: &str) -> Result<&'a [u8]> {
    if *pos + n > data.len() {
        return Err(Error::malformed_key(format!(
            "truncated at {what} (need {n} bytes at offset {pos}, have {})",
            data.len()
        )));
    }
    let out = &data[*pos..*pos + n];
    *pos += n;
    Ok(out)
}

/// Parse a native key (without timestamp suffix).
pub fn parse_key(key: &[u8]) -> Result<ParsedKey> {
    let mut pos = 0;
    let plane = take(key, &mut pos, 1, "plane")?[0];
    let attr_len = u16::from_be_bytes(take(key, &mut pos, 2, "attr length")?.try_into().unwrap());
    let attr_bytes = take(key, &mut pos, attr_len as usize, "attr")?;
    let attr = std::str::from_utf8(attr_bytes)
        .map_err(|e| Error::malformed_key(format!("attr is not utf-8: {e}")))?
        .to_owned();
    let (namespace, _) = parse_namespace_attr(&attr)?;

    let mut parsed = ParsedKey {
        namespace,
        attr,
        kind: KeyKind::Data,
        uid: 0,
        start_uid: 0,
        term: Vec::new(),
        count: 0,
        has_start_uid: false,
    };

    match plane {
        PLANE_SCHEMA | PLANE_TYPE => {
            if pos != key.len() {
                return Err(Error::malformed_key("trailing bytes after schema/type key"));
            }
            parsed.kind = if plane == PLANE_SCHEMA {
                KeyKind::Schema
            } else {
                KeyKind::Type
            };
        }
        PLANE_DATA => {
            let kind_byte = take(key, &mut pos, 1, "kind")?[0];
            let split = kind_byte & SPLIT_FLAG != 0;
            match kind_byte & !SPLIT_FLAG {
                KIND_DATA | KIND_REVERSE => {
                    parsed.kind = if kind_byte & !SPLIT_FLAG == KIND_DATA {
                        KeyKind::Data
                    } else {
                        KeyKind::Reverse
                    };
                    parsed.uid =
                        u64::from_be_bytes(take(key, &mut pos, 8, "uid")?.try_into().unwrap());
                    if split {
                        if parsed.kind != KeyKind::Data {
                            return Err(Error::malformed_key("split flag on a non-data key"));
                        }
                        parsed.start_uid = u64::from_be_bytes(
                            take(key, &mut pos, 8, "start uid")?.try_into().unwrap(),
                        );
                        parsed.has_start_uid = true;
                    }
                    if pos != key.len() {
                        return Err(Error::malformed_key("trailing bytes after data key"));
                    }
                }
                KIND_INDEX => {
                    if split {
                        return Err(Error::malformed_key("split flag on an index key"));
                    }
                    parsed.kind = KeyKind::Index;
                    parsed.term = key[pos..].to_vec();
                }
                KIND_COUNT | KIND_COUNT_REV => {
                    if split {
                        return Err(Error::malformed_key("split flag on a count key"));
                    }
                    parsed.kind = if kind_byte == KIND_COUNT {
                        KeyKind::Count
                    } else {
                        KeyKind::CountRev
                    };
                    parsed.count =
                        u32::from_be_bytes(take(key, &mut pos, 4, "count")?.try_into().unwrap());
                    if pos != key.len() {
                        return Err(Error::malformed_key("trailing bytes after count key"));
                    }
                }
                other => {
                    return Err(Error::malformed_key(format!("unknown kind byte {other:#04x}")))
                }
            }
        }
        other => return Err(Error::malformed_key(format!("unknown plane byte {other:#04x}"))),
    }

    Ok(parsed)
}

// ============================================================================
// Timestamp suffix
// ============================================================================

/// Append `ts` to `key` as a big-endian suffix segment.
pub fn key_with_ts(key: &[u8], ts: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + TS_SUFFIX_LEN);
    out.extend_from_slice(key);
    out.extend_from_slice(&ts.to_be_bytes());
    out
}

/// Read the timestamp suffix of a key produced by [`key_with_ts`].
pub fn parse_ts(key: &[u8]) -> Result<u64> {
    if key.len() < TS_SUFFIX_LEN {
        return Err(Error::malformed_key("key is too short for a timestamp suffix"));
    }
    Ok(u64::from_be_bytes(
        key[key.len() - TS_SUFFIX_LEN..].try_into().unwrap(),
    ))
}

/// Strip the timestamp suffix of a key produced by [`key_with_ts`].
pub fn strip_ts(key: &[u8]) -> Result<&[u8]> {
    if key.len() < TS_SUFFIX_LEN {
        return Err(Error::malformed_key("key is too short for a timestamp suffix"));
    }
    Ok(&key[..key.len() - TS_SUFFIX_LEN])
}

/// Order two suffixed keys: key prefix first, timestamp second.
///
/// Both arguments must carry the [`key_with_ts`] suffix.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    debug_assert!(
        a.len() >= TS_SUFFIX_LEN && b.len() >= TS_SUFFIX_LEN,
        "compare_keys requires the timestamp suffix"
    );
    let (ak, at) = a.split_at(a.len().saturating_sub(TS_SUFFIX_LEN));
    let (bk, bt) = b.split_at(b.len().saturating_sub(TS_SUFFIX_LEN));
    match ak.cmp(bk) {
        Ordering::Equal => at.cmp(bt),
        ord => ord,
    }
}

// ============================================================================
// Backup keys (archive wire format)
// ============================================================================

/// The key form stored in backup archives.
///
/// Backups keep the namespace as an explicit field and the attribute bare;
/// the native form joins them. Wire layout (little-endian):
///
/// ```text
/// namespace u64 | kind u8 | uid u64 | start_uid u64 | count u32 |
/// attr (u16 len + bytes) | term (u16 len + bytes)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupKey {
    pub namespace: u64,
    pub kind: KeyKind,
    /// Bare attribute name (no namespace prefix).
    pub attr: String,
    pub uid: u64,
    /// Non-zero marks one part of a multi-part posting list.
    pub start_uid: u64,
    pub term: Vec<u8>,
    pub count: u32,
}

impl BackupKey {
    pub fn marshal(&self) -> Vec<u8> {
        use crate::wire::write_len_bytes16;
        let mut buf = Vec::with_capacity(32 + self.attr.len() + self.term.len());
        buf.extend_from_slice(&self.namespace.to_le_bytes());
        buf.push(self.kind.wire_tag());
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.start_uid.to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());
        write_len_bytes16(&mut buf, self.attr.as_bytes());
        write_len_bytes16(&mut buf, &self.term);
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        use crate::wire::{read_len_bytes16, read_u32, read_u64, read_u8};
        let mut pos = 0;
        let namespace = read_u64(data, &mut pos)?;
        let kind = KeyKind::from_wire_tag(read_u8(data, &mut pos)?)?;
        let uid = read_u64(data, &mut pos)?;
        let start_uid = read_u64(data, &mut pos)?;
        let count = read_u32(data, &mut pos)?;
        let attr = std::str::from_utf8(read_len_bytes16(data, &mut pos)?)
            .map_err(|e| Error::malformed_key(format!("backup key attr is not utf-8: {e}")))?
            .to_owned();
        let term = read_len_bytes16(data, &mut pos)?.to_vec();
        if pos != data.len() {
            return Err(Error::malformed_key("trailing bytes after backup key"));
        }
        Ok(BackupKey {
            namespace,
            kind,
            attr,
            uid,
            start_uid,
            term,
            count,
        })
    }

    /// Build the native key this backup key restores to.
    pub fn to_native(&self) -> Result<Vec<u8>> {
        let attr = namespace_attr(self.namespace, &self.attr);
        let key = match self.kind {
            KeyKind::Data => data_key(&attr, self.uid),
            KeyKind::Reverse => reverse_key(&attr, self.uid),
            KeyKind::Index => index_key(&attr, &self.term),
            KeyKind::Count => count_key(&attr, self.count, false),
            KeyKind::CountRev => count_key(&attr, self.count, true),
            KeyKind::Schema => schema_key(&attr),
            KeyKind::Type => type_key(&attr),
        };
        if self.start_uid != 0 {
            return split_key(&key, self.start_uid);
        }
        Ok(key)
    }
}

/// Decode a marshalled backup key into `(native key, namespace)`.
pub fn from_backup_key(data: &[u8]) -> Result<(Vec<u8>, u64)> {
    let bk = BackupKey::unmarshal(data)?;
    let native = bk.to_native()?;
    Ok((native, bk.namespace))
}

/// Re-derive the backup key a native key came from.
pub fn backup_key_from_native(key: &[u8]) -> Result<BackupKey> {
    let parsed = parse_key(key)?;
    let (namespace, bare) = parse_namespace_attr(&parsed.attr)?;
    Ok(BackupKey {
        namespace,
        kind: parsed.kind,
        attr: bare.to_owned(),
        uid: parsed.uid,
        start_uid: parsed.start_uid,
        term: parsed.term,
        count: parsed.count,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::namespace_attr;

    #[test]
    fn test_data_key_round_trip() {
        let attr = namespace_attr(1, "name");
        let key = data_key(&attr, 42);
        let parsed = parse_key(&key).unwrap();
        assert_eq!(parsed.namespace, 1);
        assert_eq!(parsed.attr, attr);
        assert_eq!(parsed.kind, KeyKind::Data);
        assert_eq!(parsed.uid, 42);
        assert!(!parsed.has_start_uid);
    }

    #[test]
    fn test_schema_and_type_keys() {
        let attr = namespace_attr(0, "name");
        let sk = parse_key(&schema_key(&attr)).unwrap();
        assert!(sk.is_schema());
        let tk = parse_key(&type_key(&attr)).unwrap();
        assert!(tk.is_type());
        assert!(!tk.is_data());
    }

    #[test]
    fn test_index_and_count_keys() {
        let attr = namespace_attr(3, "email");
        let ik = parse_key(&index_key(&attr, b"term")).unwrap();
        assert_eq!(ik.kind, KeyKind::Index);
        assert_eq!(ik.term, b"term");

        let ck = parse_key(&count_key(&attr, 9, false)).unwrap();
        assert_eq!(ck.kind, KeyKind::Count);
        assert_eq!(ck.count, 9);

        let crk = parse_key(&count_key(&attr, 9, true)).unwrap();
        assert_eq!(crk.kind, KeyKind::CountRev);
    }

    #[test]
    fn test_split_key_round_trip() {
        let attr = namespace_attr(1, "follows");
        let base = data_key(&attr, 7);
        let split = split_key(&base, 1000).unwrap();
        let parsed = parse_key(&split).unwrap();
        assert!(parsed.has_start_uid);
        assert_eq!(parsed.uid, 7);
        assert_eq!(parsed.start_uid, 1000);

        // A split key cannot be split again.
        assert!(split_key(&split, 2000).is_err());
    }

    #[test]
    fn test_keys_sort_by_uid() {
        let attr = namespace_attr(1, "name");
        let mut keys: Vec<Vec<u8>> = [30u64, 10, 20]
            .iter()
            .map(|uid| data_key(&attr, *uid))
            .collect();
        keys.sort();
        let uids: Vec<u64> = keys.iter().map(|k| parse_key(k).unwrap().uid).collect();
        assert_eq!(uids, vec![10, 20, 30]);
    }

    #[test]
    fn test_ts_suffix_round_trip() {
        let attr = namespace_attr(1, "name");
        let key = data_key(&attr, 7);
        let with_ts = key_with_ts(&key, 55);
        assert_eq!(parse_ts(&with_ts).unwrap(), 55);
        assert_eq!(strip_ts(&with_ts).unwrap(), &key[..]);
    }

    #[test]
    fn test_compare_keys_orders_ts_last() {
        let attr = namespace_attr(1, "name");
        let a = key_with_ts(&data_key(&attr, 7), 50);
        let b = key_with_ts(&data_key(&attr, 7), 60);
        let c = key_with_ts(&data_key(&attr, 8), 10);
        assert_eq!(compare_keys(&a, &b), Ordering::Less);
        assert_eq!(compare_keys(&b, &c), Ordering::Less);
        assert_eq!(compare_keys(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_compare_keys_prefix_key() {
        // A key that is a byte-prefix of another must still sort by the key
        // part, not by whatever the longer key has where the short one ends.
        let short = key_with_ts(&index_key(&namespace_attr(1, "p"), b"a"), u64::MAX);
        let long = key_with_ts(&index_key(&namespace_attr(1, "p"), b"a\x00"), 0);
        assert_eq!(compare_keys(&short, &long), Ordering::Less);
    }

    #[test]
    fn test_backup_key_round_trip() {
        let bk = BackupKey {
            namespace: 5,
            kind: KeyKind::Data,
            attr: "name".to_owned(),
            uid: 77,
            start_uid: 0,
            term: Vec::new(),
            count: 0,
        };
        let decoded = BackupKey::unmarshal(&bk.marshal()).unwrap();
        assert_eq!(decoded, bk);

        let (native, ns) = from_backup_key(&bk.marshal()).unwrap();
        assert_eq!(ns, 5);
        let back = backup_key_from_native(&native).unwrap();
        assert_eq!(back, bk);
    }

    #[test]
    fn test_backup_key_split_to_native() {
        let bk = BackupKey {
            namespace: 1,
            kind: KeyKind::Data,
            attr: "follows".to_owned(),
            uid: 7,
            start_uid: 500,
            term: Vec::new(),
            count: 0,
        };
        let native = bk.to_native().unwrap();
        let parsed = parse_key(&native).unwrap();
        assert!(parsed.has_start_uid);
        assert_eq!(parsed.start_uid, 500);
        assert_eq!(backup_key_from_native(&native).unwrap(), bk);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_key(&[]).is_err());
        assert!(parse_key(&[0xff, 0, 0]).is_err());
        assert!(BackupKey::unmarshal(b"not a key").is_err());
    }
}

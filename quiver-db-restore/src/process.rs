//! Record processor: decode, filter, rewrite, and buffer map entries.
//!
//! Each worker consumes record batches from the request channel, applies the
//! per-record policy (meta validation, key decode, schema/predicate filters,
//! posting passthrough-or-rollup, schema version migration), and appends map
//! entries to a thread-local buffer that spills to the merger pool past the
//! soft cap.
//!
//! Decode failures are fatal to the phase. Migration failures on historical
//! schema records are logged and the record skipped, so one corrupt record
//! in an old backup does not sink the whole restore.

use crate::buffer::SliceBuffer;
use crate::error::{RestoreError, Result};
use crate::map_file::encode_entry;
use crate::mapper::{send_or_cancel, MapContext};
use crossbeam_channel::{select, Receiver, Sender};
use quiver_db_core::{
    attr_from_2103, from_backup_key, galaxy_attr, key_with_ts, marshal_posting_list, parse_key,
    rollup, should_split, BackupPostingList, Kv, KvList, ParsedKey, PostingList, SchemaUpdate,
    TypeUpdate, BIT_COMPLETE_POSTING, BIT_DELTA_POSTING, BIT_EMPTY_POSTING, BIT_SCHEMA_POSTING,
};
use rustc_hash::FxHashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Per-archive processing policy, snapshotted by the planner.
///
/// The drop set only ever changes between archives, so workers see one
/// stable descriptor per archive.
#[derive(Debug, Clone, Default)]
pub struct LoadDescriptor {
    /// Predicates to restore; anything else (except type keys) is skipped.
    pub preds: FxHashSet<String>,
    /// Namespaces whose data records are dropped.
    pub drop_ns: FxHashSet<u64>,
    /// On-disk format version the archive was written with.
    pub version: i32,
    /// Keep schema/type records. True only for the newest archive.
    pub keep_schema: bool,
}

/// One unit of work: a buffer of marshalled record batches plus the policy
/// of the archive they came from.
pub(crate) struct ListReq {
    pub batches: SliceBuffer,
    pub input: Arc<LoadDescriptor>,
}

/// Worker loop: drain the request channel, spill full buffers, then flush
/// the tail and fold the worker-local maxima into the shared counters.
pub(crate) fn process_req_ch(
    ctx: &MapContext,
    req_rx: &Receiver<ListReq>,
    write_tx: &Sender<SliceBuffer>,
) -> Result<()> {
    let mut p = Processor {
        restore_ts: ctx.restore_ts,
        max_uid: 0,
        max_ns: 0,
        scratch: Vec::new(),
    };
    let spill_cap = ctx.cfg.spill_soft_cap.min(ctx.buf_capacity());
    let mut buf = SliceBuffer::with_capacity(spill_cap);

    loop {
        let req = select! {
            recv(req_rx) -> res => match res {
                Ok(req) => req,
                Err(_) => break, // planner is done
            },
            recv(ctx.cancel.done()) -> _ => return Err(RestoreError::Cancelled),
        };
        for batch in req.batches.iter() {
            if ctx.cancel.is_cancelled() {
                return Err(RestoreError::Cancelled);
            }
            let list = KvList::unmarshal(batch)?;
            for kv in &list.kvs {
                p.process_kv(&mut buf, &req.input, kv)?;
                if buf.len_bytes() > ctx.cfg.spill_soft_cap {
                    let full = std::mem::replace(&mut buf, SliceBuffer::with_capacity(spill_cap));
                    send_or_cancel(write_tx, &ctx.cancel, full)?;
                }
            }
        }
    }
    send_or_cancel(write_tx, &ctx.cancel, buf)?;

    ctx.max_uid.fetch_max(p.max_uid, Ordering::Relaxed);
    ctx.max_ns.fetch_max(p.max_ns, Ordering::Relaxed);
    Ok(())
}

/// Worker-local record processor.
struct Processor {
    restore_ts: u64,
    max_uid: u64,
    max_ns: u64,
    scratch: Vec<u8>,
}

impl Processor {
    /// Append `kv` as one map entry. `key_ts` is the source record version,
    /// embedded in the key suffix; `kv.version` is already the restore
    /// timestamp.
    fn push(&mut self, buf: &mut SliceBuffer, kv: &Kv, key_ts: u64) {
        let key = key_with_ts(&kv.key, key_ts);
        encode_entry(&key, kv, &mut self.scratch);
        buf.push(&self.scratch);
    }

    fn process_kv(&mut self, buf: &mut SliceBuffer, input: &LoadDescriptor, kv: &Kv) -> Result<()> {
        if kv.user_meta.len() != 1 {
            return Err(RestoreError::decode(format!(
                "unexpected meta {:?} for key {:02x?}",
                kv.user_meta, kv.key
            )));
        }

        let (restore_key, ns) = from_backup_key(&kv.key)?;
        let parsed = parse_key(&restore_key)?;

        self.max_uid = self.max_uid.max(parsed.uid);
        self.max_ns = self.max_ns.max(ns);

        // Schema records only survive from the newest archive.
        if !input.keep_schema && (parsed.is_schema() || parsed.is_type()) {
            return Ok(());
        }
        // Type keys are global per group; their attr is not a predicate name.
        if !parsed.is_type() && !input.preds.contains(&parsed.attr) {
            return Ok(());
        }

        match kv.user_meta[0] {
            BIT_EMPTY_POSTING | BIT_COMPLETE_POSTING | BIT_DELTA_POSTING => {
                if input.drop_ns.contains(&ns) {
                    return Ok(());
                }
                let bpl = if kv.value.is_empty() {
                    BackupPostingList::default()
                } else {
                    BackupPostingList::unmarshal(&kv.value)?
                };
                let pl = PostingList::from_backup(&bpl);

                if !should_split(&pl) || parsed.has_start_uid || !pl.splits.is_empty() {
                    // Small lists pass through unchanged, and so does each
                    // part of an already-split list from an old backup.
                    let (value, meta) = marshal_posting_list(&pl);
                    let new_kv = Kv {
                        key: restore_key,
                        value,
                        user_meta: vec![meta],
                        version: self.restore_ts,
                        stream_id: 0,
                    };
                    self.push(buf, &new_kv, kv.version);
                } else {
                    // Complete oversized list: roll up at the record's read
                    // timestamp, which may fan out into a primary record
                    // plus splits.
                    let mut pl = pl;
                    pl.commit_ts = kv.version;
                    for mut part in rollup(&restore_key, pl)? {
                        let key_ts = part.version;
                        part.version = self.restore_ts;
                        self.push(buf, &part, key_ts);
                    }
                }
            }

            BIT_SCHEMA_POSTING => {
                let mut kv = kv.clone();
                if !migrate_schema_value(&mut kv, &parsed, input.version) {
                    return Ok(());
                }
                // Reset the stream id so downstream stream writers never see
                // stale ordering hints.
                kv.stream_id = 0;
                kv.key = restore_key;
                let key_ts = kv.version;
                kv.version = self.restore_ts;
                self.push(buf, &kv, key_ts);
            }

            meta => {
                return Err(RestoreError::decode(format!(
                    "unexpected meta {meta:#04x} for key {:02x?}",
                    kv.key
                )))
            }
        }
        Ok(())
    }
}

// ============================================================================
// Schema version migration
// ============================================================================

/// Rewrite a schema/type value for the archive's on-disk format version.
///
/// Returns false when the value cannot be decoded; the caller skips the
/// record and the restore continues.
fn migrate_schema_value(kv: &mut Kv, parsed: &ParsedKey, version: i32) -> bool {
    match version {
        0 => {
            // Pre-namespace backups: qualify the type name and its field
            // predicates with the default namespace.
            if parsed.is_type() {
                match append_namespace(&kv.value) {
                    Ok(value) => kv.value = value,
                    Err(e) => {
                        tracing::error!(key = ?parsed, error = %e, "unable to migrate type record, skipping");
                        return false;
                    }
                }
            }
            true
        }
        2103 => match change_format_2103(&kv.value, parsed) {
            Ok(Some(value)) => {
                kv.value = value;
                true
            }
            Ok(None) => true,
            Err(e) => {
                tracing::error!(key = ?parsed, error = %e, "unable to migrate 2103 record, skipping");
                false
            }
        },
        // 2105 and later already use the current formats.
        _ => true,
    }
}

fn append_namespace(value: &[u8]) -> quiver_db_core::Result<Vec<u8>> {
    let mut update = TypeUpdate::unmarshal(value)?;
    update.type_name = galaxy_attr(&update.type_name);
    for field in &mut update.fields {
        field.predicate = galaxy_attr(&field.predicate);
    }
    Ok(update.marshal())
}

/// 2103 stored predicates as `<ns 8 bytes>|<attr>`; rewrite every embedded
/// name to the hex form.
fn change_format_2103(value: &[u8], parsed: &ParsedKey) -> quiver_db_core::Result<Option<Vec<u8>>> {
    if parsed.is_schema() {
        let mut update = SchemaUpdate::unmarshal(value)?;
        update.predicate = attr_from_2103(&update.predicate)?;
        return Ok(Some(update.marshal()));
    }
    if parsed.is_type() {
        let mut update = TypeUpdate::unmarshal(value)?;
        update.type_name = attr_from_2103(&update.type_name)?;
        for field in &mut update.fields {
            field.predicate = attr_from_2103(&field.predicate)?;
        }
        return Ok(Some(update.marshal()));
    }
    Ok(None)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_file::{entry_data, entry_key};
    use quiver_db_core::{namespace_attr, parse_ts, strip_ts, BackupKey, KeyKind, Posting};

    fn descriptor(preds: &[&str], keep_schema: bool) -> LoadDescriptor {
        LoadDescriptor {
            preds: preds.iter().map(|p| p.to_string()).collect(),
            drop_ns: FxHashSet::default(),
            version: 2105,
            keep_schema,
        }
    }

    fn posting_kv(ns: u64, attr: &str, uid: u64, version: u64, uids: &[u64]) -> Kv {
        let bk = BackupKey {
            namespace: ns,
            kind: KeyKind::Data,
            attr: attr.to_owned(),
            uid,
            start_uid: 0,
            term: Vec::new(),
            count: 0,
        };
        let bpl = BackupPostingList {
            uids: uids.to_vec(),
            postings: vec![],
            commit_ts: version,
            splits: vec![],
        };
        Kv {
            key: bk.marshal(),
            value: bpl.marshal(),
            user_meta: vec![BIT_COMPLETE_POSTING],
            version,
            stream_id: 0,
        }
    }

    fn run_one(input: &LoadDescriptor, kv: &Kv) -> (Processor, SliceBuffer) {
        let mut p = Processor {
            restore_ts: 100,
            max_uid: 0,
            max_ns: 0,
            scratch: Vec::new(),
        };
        let mut buf = SliceBuffer::with_capacity(1024);
        p.process_kv(&mut buf, input, kv).unwrap();
        (p, buf)
    }

    #[test]
    fn test_posting_passthrough_versions() {
        let input = descriptor(&[&namespace_attr(1, "name")], true);
        let kv = posting_kv(1, "name", 7, 50, &[7]);
        let (p, buf) = run_one(&input, &kv);

        assert_eq!(buf.num_slices(), 1);
        let entry = buf.iter().next().unwrap();
        // Key suffix holds the source version; record holds restore_ts.
        assert_eq!(parse_ts(entry_key(entry)).unwrap(), 50);
        let out = Kv::unmarshal(entry_data(entry)).unwrap();
        assert_eq!(out.version, 100);
        assert_eq!(
            strip_ts(entry_key(entry)).unwrap(),
            out.key.as_slice(),
        );
        assert_eq!(p.max_uid, 7);
        assert_eq!(p.max_ns, 1);
    }

    #[test]
    fn test_predicate_filter_skips_but_counts() {
        let input = descriptor(&[&namespace_attr(1, "name")], true);
        let kv = posting_kv(1, "other", 9, 60, &[9]);
        let (p, buf) = run_one(&input, &kv);
        assert!(buf.is_empty());
        // Maxima still track filtered records.
        assert_eq!(p.max_uid, 9);
        assert_eq!(p.max_ns, 1);
    }

    #[test]
    fn test_dropped_namespace_skips() {
        let mut input = descriptor(&[&namespace_attr(42, "name")], true);
        input.drop_ns.insert(42);
        let kv = posting_kv(42, "name", 3, 60, &[3]);
        let (p, buf) = run_one(&input, &kv);
        assert!(buf.is_empty());
        assert_eq!(p.max_ns, 42);
    }

    #[test]
    fn test_schema_filtered_without_keep_schema() {
        let attr = namespace_attr(1, "name");
        let input = descriptor(&[&attr], false);
        let bk = BackupKey {
            namespace: 1,
            kind: KeyKind::Schema,
            attr: "name".to_owned(),
            uid: 0,
            start_uid: 0,
            term: Vec::new(),
            count: 0,
        };
        let kv = Kv {
            key: bk.marshal(),
            value: SchemaUpdate {
                predicate: attr.clone(),
                ..Default::default()
            }
            .marshal(),
            user_meta: vec![BIT_SCHEMA_POSTING],
            version: 30,
            stream_id: 0,
        };
        let (_, buf) = run_one(&input, &kv);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_schema_record_resets_stream_id() {
        let attr = namespace_attr(1, "name");
        let input = descriptor(&[&attr], true);
        let bk = BackupKey {
            namespace: 1,
            kind: KeyKind::Schema,
            attr: "name".to_owned(),
            uid: 0,
            start_uid: 0,
            term: Vec::new(),
            count: 0,
        };
        let kv = Kv {
            key: bk.marshal(),
            value: SchemaUpdate {
                predicate: attr.clone(),
                ..Default::default()
            }
            .marshal(),
            user_meta: vec![BIT_SCHEMA_POSTING],
            version: 30,
            stream_id: 7,
        };
        let (_, buf) = run_one(&input, &kv);
        let entry = buf.iter().next().unwrap();
        let out = Kv::unmarshal(entry_data(entry)).unwrap();
        assert_eq!(out.stream_id, 0);
        assert_eq!(out.version, 100);
        assert_eq!(parse_ts(entry_key(entry)).unwrap(), 30);
    }

    #[test]
    fn test_bad_meta_is_fatal() {
        let input = descriptor(&[&namespace_attr(1, "name")], true);
        let mut kv = posting_kv(1, "name", 7, 50, &[7]);
        kv.user_meta = vec![0x40];
        let mut p = Processor {
            restore_ts: 100,
            max_uid: 0,
            max_ns: 0,
            scratch: Vec::new(),
        };
        let mut buf = SliceBuffer::with_capacity(64);
        assert!(p.process_kv(&mut buf, &input, &kv).is_err());

        kv.user_meta = vec![];
        assert!(p.process_kv(&mut buf, &input, &kv).is_err());
    }

    #[test]
    fn test_rollup_fanout_keeps_version_convention() {
        let attr = namespace_attr(1, "follows");
        let input = descriptor(&[&attr], true);

        // Oversized complete list: value-heavy postings over several blocks.
        let uids: Vec<u64> = (0..700u64).collect();
        let postings: Vec<Posting> = uids
            .iter()
            .map(|&uid| Posting {
                uid,
                value_type: 1,
                value: vec![0x77; 1024],
            })
            .collect();
        let bk = BackupKey {
            namespace: 1,
            kind: KeyKind::Data,
            attr: "follows".to_owned(),
            uid: 9,
            start_uid: 0,
            term: Vec::new(),
            count: 0,
        };
        let kv = Kv {
            key: bk.marshal(),
            value: BackupPostingList {
                uids,
                postings,
                commit_ts: 55,
                splits: vec![],
            }
            .marshal(),
            user_meta: vec![BIT_COMPLETE_POSTING],
            version: 55,
            stream_id: 0,
        };

        let (_, buf) = run_one(&input, &kv);
        assert!(buf.num_slices() > 2);
        for entry in buf.iter() {
            assert_eq!(parse_ts(entry_key(entry)).unwrap(), 55);
            let out = Kv::unmarshal(entry_data(entry)).unwrap();
            assert_eq!(out.version, 100);
        }
    }

    #[test]
    fn test_migrate_v0_type_record() {
        let update = TypeUpdate {
            type_name: "Person".to_owned(),
            fields: vec![SchemaUpdate {
                predicate: "name".to_owned(),
                ..Default::default()
            }],
        };
        let mut kv = Kv {
            value: update.marshal(),
            ..Default::default()
        };
        let parsed = parse_key(&quiver_db_core::keys::type_key(&namespace_attr(0, "Person")))
            .unwrap();
        assert!(migrate_schema_value(&mut kv, &parsed, 0));
        let migrated = TypeUpdate::unmarshal(&kv.value).unwrap();
        assert_eq!(migrated.type_name, "0000000000000000-Person");
        assert_eq!(migrated.fields[0].predicate, "0000000000000000-name");
    }

    #[test]
    fn test_migrate_2103_type_record() {
        let mut raw_name = Vec::new();
        raw_name.extend_from_slice(&1u64.to_be_bytes());
        raw_name.push(b'|');
        raw_name.extend_from_slice(b"Person");
        let mut raw_pred = Vec::new();
        raw_pred.extend_from_slice(&1u64.to_be_bytes());
        raw_pred.push(b'|');
        raw_pred.extend_from_slice(b"name");

        let update = TypeUpdate {
            type_name: String::from_utf8(raw_name).unwrap(),
            fields: vec![SchemaUpdate {
                predicate: String::from_utf8(raw_pred).unwrap(),
                ..Default::default()
            }],
        };
        let mut kv = Kv {
            value: update.marshal(),
            ..Default::default()
        };
        let parsed = parse_key(&quiver_db_core::keys::type_key(&namespace_attr(1, "Person")))
            .unwrap();
        assert!(migrate_schema_value(&mut kv, &parsed, 2103));
        let migrated = TypeUpdate::unmarshal(&kv.value).unwrap();
        assert_eq!(migrated.type_name, "0000000000000001-Person");
        assert_eq!(migrated.fields[0].predicate, "0000000000000001-name");
    }

    #[test]
    fn test_migration_failure_skips_record() {
        let mut kv = Kv {
            value: b"garbage".to_vec(),
            ..Default::default()
        };
        let parsed = parse_key(&quiver_db_core::keys::type_key(&namespace_attr(0, "T"))).unwrap();
        assert!(!migrate_schema_value(&mut kv, &parsed, 0));
        // 2105+ never touches the value.
        assert!(migrate_schema_value(&mut kv, &parsed, 2105));
    }
}

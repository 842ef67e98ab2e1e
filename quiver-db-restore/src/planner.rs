//! Manifest planner: the sequential driver of the map phase.
//!
//! Walks the manifest chain newest → oldest, streaming each eligible
//! archive into the processor pool while folding drop operations into the
//! evolving drop set. Walking newest-first lets a later drop short-circuit
//! work on earlier archives, and only the newest archive keeps its schema
//! records.

use crate::buffer::SliceBuffer;
use crate::config::MapConfig;
use crate::error::{RestoreError, Result};
use crate::manifest::{backup_file_name, DropOp, Manifest, ManifestSource};
use crate::mapper::{merge_and_send, send_or_cancel, MapContext, WriterSlots};
use crate::process::{process_req_ch, ListReq, LoadDescriptor};
use crate::progress::progress_loop;
use crate::reader::BackupReader;
use crate::source::{LiveStore, RestoreRequest, UriHandler};
use crossbeam_channel::{bounded, Sender};
use rustc_hash::FxHashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

/// Outcome of the map phase, consumed by the reduce phase and the caller's
/// uid/namespace lease bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapResult {
    /// Highest uid seen across all records, filtered or not.
    pub max_uid: u64,
    /// Highest namespace seen, including banned namespaces.
    pub max_ns: u64,
    /// A drop-all was encountered; an incremental restore must wipe the
    /// store before the reduce phase replays on top of it.
    pub should_drop_all: bool,
    /// Predicates dropped somewhere in the chain.
    pub drop_attr: FxHashSet<String>,
    /// Namespaces whose data was dropped somewhere in the chain.
    pub drop_ns: FxHashSet<u64>,
}

/// The evolving drop set, mutated only between archives.
#[derive(Debug, Default)]
struct DropState {
    drop_all: bool,
    drop_attr: FxHashSet<String>,
    drop_ns: FxHashSet<u64>,
    max_banned_ns: u64,
}

/// Run the restore map phase: stream every eligible archive in the chain,
/// transform its records, and write sorted partitioned map files under
/// `cfg.map_dir`.
pub fn run_map_phase(
    req: &RestoreRequest,
    handler: &dyn UriHandler,
    manifest_src: &dyn ManifestSource,
    store: &dyn LiveStore,
    cfg: MapConfig,
) -> Result<MapResult> {
    req.validate()?;
    let manifests = manifest_src.manifests(req)?;
    tracing::info!(backups = manifests.len(), "fetched manifest chain");

    std::fs::create_dir_all(&cfg.map_dir)?;

    let num_workers = cfg.effective_workers();
    let num_mergers = (num_workers / 2).max(1);
    tracing::info!(num_workers, num_mergers, "starting restore map phase");

    let ctx = Arc::new(MapContext::new(cfg, req.restore_ts));
    let (req_tx, req_rx) = bounded::<ListReq>(num_workers + num_workers / 4);
    let (write_tx, write_rx) = bounded::<SliceBuffer>(num_workers);
    let slots = Arc::new(WriterSlots::new(num_mergers));

    let mut workers = Vec::with_capacity(num_workers);
    for i in 0..num_workers {
        let ctx = Arc::clone(&ctx);
        let req_rx = req_rx.clone();
        let write_tx = write_tx.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("restore-map-{i}"))
                .spawn(move || {
                    if let Err(e) = process_req_ch(&ctx, &req_rx, &write_tx) {
                        ctx.fail(e);
                    }
                })?,
        );
    }
    // The workers now hold the only write senders; the channel closes when
    // the last worker exits, so no tail buffer can be lost.
    drop(write_tx);

    let mut mergers = Vec::with_capacity(num_mergers);
    for i in 0..num_mergers {
        let ctx = Arc::clone(&ctx);
        let write_rx = write_rx.clone();
        let slots = Arc::clone(&slots);
        mergers.push(
            thread::Builder::new()
                .name(format!("restore-merge-{i}"))
                .spawn(move || {
                    if let Err(e) = merge_and_send(&ctx, &write_rx, &slots) {
                        ctx.fail(e);
                    }
                })?,
        );
    }

    let (done_tx, done_rx) = bounded::<()>(1);
    let progress = {
        let ctx = Arc::clone(&ctx);
        let req_rx = req_rx.clone();
        let write_rx = write_rx.clone();
        let slots = Arc::clone(&slots);
        thread::Builder::new()
            .name("restore-progress".to_owned())
            .spawn(move || progress_loop(&ctx, &req_rx, &write_rx, &slots, &done_rx))?
    };

    let mut drops = DropState::default();
    let plan_err = plan_archives(&ctx, req, handler, &manifests, store, &req_tx, &mut drops).err();

    drop(req_tx);
    for handle in workers {
        let _ = handle.join();
    }
    for handle in mergers {
        let _ = handle.join();
    }
    drop(done_tx);
    let _ = progress.join();

    if !ctx.size_hist.is_empty() {
        tracing::info!(histogram = %ctx.size_hist, "map input batch sizes");
    }

    if let Some(err) = ctx.take_err() {
        return Err(err);
    }
    if let Some(err) = plan_err {
        return Err(err);
    }

    Ok(MapResult {
        max_uid: ctx.max_uid.load(Ordering::Relaxed),
        max_ns: ctx.max_ns.load(Ordering::Relaxed).max(drops.max_banned_ns),
        should_drop_all: drops.drop_all,
        drop_attr: drops.drop_attr,
        drop_ns: drops.drop_ns,
    })
}

/// Walk the manifest chain, streaming archives and folding drops.
fn plan_archives(
    ctx: &MapContext,
    req: &RestoreRequest,
    handler: &dyn UriHandler,
    manifests: &[Manifest],
    store: &dyn LiveStore,
    req_tx: &Sender<ListReq>,
    drops: &mut DropState,
) -> Result<()> {
    for (i, manifest) in manifests.iter().enumerate() {
        // Only the archives at or past the incremental start matter.
        if manifest.backup_num < req.incremental_from {
            break;
        }
        // A drop-all wipes everything older; no point reading further back.
        if drops.drop_all {
            break;
        }
        if manifest.valid_read_ts() == 0 || manifest.groups.is_empty() {
            continue;
        }

        if manifest.groups.contains_key(&req.group_id) {
            // Restore the predicates assigned to this group at the time of
            // the newest backup, minus anything dropped since this archive.
            let mut preds = manifests[0].preds_in_group(req.group_id);
            preds.retain(|p| !drops.drop_attr.contains(p));

            let input = Arc::new(LoadDescriptor {
                preds,
                drop_ns: drops.drop_ns.clone(),
                version: manifest.version,
                keep_schema: i == 0,
            });

            let name = backup_file_name(manifest.valid_read_ts(), req.group_id);
            let file = if manifest.path.is_empty() {
                name
            } else {
                format!("{}/{}", manifest.path, name)
            };
            let mut br =
                BackupReader::open(handler, &file, &req.encryption_key, &manifest.compression)?;
            map_archive(ctx, &mut br, req_tx, input)?;
        }

        for op in &manifest.drop_operations {
            match op.op {
                DropOp::All => drops.drop_all = true,
                DropOp::Data => {
                    if op.value.is_empty() {
                        // Pre-2105 backups spell drop-all as an empty
                        // drop-data.
                        drops.drop_all = true;
                        continue;
                    }
                    drops.drop_ns.insert(parse_namespace_value(&op.value)?);
                }
                DropOp::Attr => {
                    drops.drop_attr.insert(op.value.clone());
                }
                DropOp::Ns => {
                    let ns = parse_namespace_value(&op.value)?;
                    store
                        .ban_namespace(ns)
                        .map_err(|e| RestoreError::store(format!("ban namespace {ns}: {e}")))?;
                    drops.max_banned_ns = drops.max_banned_ns.max(ns);
                }
            }
        }
        tracing::info!(backup_num = manifest.backup_num, "processed manifest");
    }
    Ok(())
}

/// Stream one archive into the request channel as batch buffers.
fn map_archive(
    ctx: &MapContext,
    br: &mut BackupReader,
    req_tx: &Sender<ListReq>,
    input: Arc<LoadDescriptor>,
) -> Result<()> {
    let batch_cap = ctx.cfg.batch_buf_sz.min(ctx.buf_capacity());
    let mut zbuf = SliceBuffer::with_capacity(batch_cap);
    loop {
        let Some(len) = br.next_batch_len()? else {
            break;
        };
        ctx.size_hist.record(len as u64);
        zbuf.push_from(br, len)?;

        if zbuf.len_bytes() > ctx.cfg.batch_soft_limit() {
            ctx.bytes_read
                .fetch_add(zbuf.len_bytes() as u64, Ordering::Relaxed);
            let full = std::mem::replace(&mut zbuf, SliceBuffer::with_capacity(batch_cap));
            send_or_cancel(
                req_tx,
                &ctx.cancel,
                ListReq {
                    batches: full,
                    input: Arc::clone(&input),
                },
            )?;
        }
    }
    ctx.bytes_read
        .fetch_add(zbuf.len_bytes() as u64, Ordering::Relaxed);
    send_or_cancel(
        req_tx,
        &ctx.cancel,
        ListReq {
            batches: zbuf,
            input,
        },
    )
}

/// Parse a manifest namespace operand: decimal or `0x` hex.
fn parse_namespace_value(value: &str) -> Result<u64> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.map_err(|e| RestoreError::decode(format!("cannot parse namespace {value:?}: {e}")))
}

// ============================================================================
// Tests
// ============================================================================

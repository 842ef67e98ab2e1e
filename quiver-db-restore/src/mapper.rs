//! Shared map-phase state, cancellation, and the spill merger pool.
//!
//! The pipeline is OS threads over bounded channels:
//!
//! ```text
//! planner → req_ch → processor pool → write_ch → merger pool → map files
//! ```
//!
//! Every blocking channel operation selects against the shared cancel
//! token, so the first fatal error anywhere unblocks the whole pipeline.
//! The only cross-thread mutable state is the atomic counter set below;
//! buffers transfer ownership by channel send.

use crate::buffer::SliceBuffer;
use crate::config::MapConfig;
use crate::error::{RestoreError, Result};
use crate::map_file::{entry_key, write_map_file};
use crate::progress::SizeHistogram;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use quiver_db_core::compare_keys;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Initial allocation cap for merge and spill buffers.
const BUF_INIT_CAP: usize = 64 << 20;

// ============================================================================
// Cancellation
// ============================================================================

/// One-shot, many-observer cancellation token.
///
/// Observers select on [`CancelToken::done`], which becomes ready (as a
/// disconnect) once [`CancelToken::cancel`] drops the guarded sender.
pub(crate) struct CancelToken {
    guard: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        CancelToken {
            guard: Mutex::new(Some(tx)),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.guard.lock().take();
    }

    /// Receiver that errors out once the token is cancelled. Never carries
    /// a value.
    pub fn done(&self) -> &Receiver<()> {
        &self.rx
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        )
    }
}

/// Send on a channel, bailing out if the phase is cancelled or the
/// receiving pool is gone.
pub(crate) fn send_or_cancel<T>(tx: &Sender<T>, cancel: &CancelToken, value: T) -> Result<()> {
    select! {
        send(tx, value) -> res => res.map_err(|_| RestoreError::Cancelled),
        recv(cancel.done()) -> _ => Err(RestoreError::Cancelled),
    }
}

// ============================================================================
// Writer slots
// ============================================================================

/// Counting semaphore bounding concurrent map file writes.
///
/// A token channel: acquiring sends into the bounded channel, releasing
/// receives one token back. The capacity is half the merger parallelism so
/// file writes never saturate the disk.
pub(crate) struct WriterSlots {
    tx: Sender<()>,
    rx: Receiver<()>,
}

/// An acquired writer slot, released on drop.
pub(crate) struct SlotGuard<'a>(&'a WriterSlots);

impl WriterSlots {
    pub fn new(slots: usize) -> Self {
        let (tx, rx) = bounded(slots.max(1));
        WriterSlots { tx, rx }
    }

    /// Block until a slot frees up (or the phase is cancelled).
    pub fn acquire(&self, cancel: &CancelToken) -> Result<SlotGuard<'_>> {
        select! {
            send(self.tx, ()) -> res => {
                res.map_err(|_| RestoreError::Cancelled)?;
                Ok(SlotGuard(self))
            }
            recv(cancel.done()) -> _ => Err(RestoreError::Cancelled),
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<SlotGuard<'_>> {
        self.tx.try_send(()).ok().map(|()| SlotGuard(self))
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.rx.len()
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.rx.recv();
    }
}

// ============================================================================
// Shared context
// ============================================================================

/// State shared by the planner, processors, mergers, and progress reporter.
pub(crate) struct MapContext {
    pub cfg: MapConfig,
    pub restore_ts: u64,

    /// Map file numbering; the next file gets `fetch_add + 1`.
    pub next_file_id: AtomicU32,
    pub bytes_read: AtomicU64,
    pub bytes_processed: AtomicU64,
    pub max_uid: AtomicU64,
    pub max_ns: AtomicU64,

    pub size_hist: SizeHistogram,
    pub cancel: CancelToken,
    first_err: Mutex<Option<RestoreError>>,
}

impl MapContext {
    pub fn new(cfg: MapConfig, restore_ts: u64) -> Self {
        MapContext {
            cfg,
            restore_ts,
            next_file_id: AtomicU32::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            max_uid: AtomicU64::new(0),
            max_ns: AtomicU64::new(0),
            size_hist: SizeHistogram::new(),
            cancel: CancelToken::new(),
            first_err: Mutex::new(None),
        }
    }

    /// Record a task failure and cancel the siblings. The first root cause
    /// wins; cancellation sentinels are not recorded.
    pub fn fail(&self, err: RestoreError) {
        if !err.is_cancelled() {
            let mut slot = self.first_err.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.cancel.cancel();
    }

    pub fn take_err(&self) -> Option<RestoreError> {
        self.first_err.lock().take()
    }

    /// Initial capacity for spill/merge buffers, bounded for small configs.
    pub fn buf_capacity(&self) -> usize {
        self.cfg.map_file_sz.min(BUF_INIT_CAP)
    }
}

// ============================================================================
// Spill merger
// ============================================================================

/// Merger worker: accumulate spilled buffers up to the map file target,
/// sort, and write.
///
/// Two flush paths on purpose: at `map_file_sz` the merger blocks for a
/// writer slot; from a quarter of that it only flushes if a slot is free
/// right now. The asymmetry staggers writes across mergers instead of
/// letting them all flush in lockstep.
pub(crate) fn merge_and_send(
    ctx: &MapContext,
    write_rx: &Receiver<SliceBuffer>,
    slots: &WriterSlots,
) -> Result<()> {
    let mut mbuf = SliceBuffer::with_capacity(ctx.buf_capacity());
    loop {
        let buf = select! {
            recv(write_rx) -> res => match res {
                Ok(buf) => buf,
                Err(_) => break, // processors drained and gone
            },
            recv(ctx.cancel.done()) -> _ => return Err(RestoreError::Cancelled),
        };
        ctx.bytes_processed
            .fetch_add(buf.len_bytes() as u64, Ordering::Relaxed);
        mbuf.absorb(buf);

        let slot = if mbuf.len_bytes() >= ctx.cfg.map_file_sz {
            Some(slots.acquire(&ctx.cancel)?)
        } else if mbuf.len_bytes() >= ctx.cfg.map_file_sz / 4 {
            slots.try_acquire()
        } else {
            None
        };
        if let Some(guard) = slot {
            let full = std::mem::replace(&mut mbuf, SliceBuffer::with_capacity(ctx.buf_capacity()));
            write_now(ctx, full, guard)?;
        }
    }
    let guard = slots.acquire(&ctx.cancel)?;
    write_now(ctx, mbuf, guard)
}

/// Sort one merged buffer and write it as a map file. The slot guard is
/// held for the duration of the write and released on return.
fn write_now(ctx: &MapContext, mut buf: SliceBuffer, _slot: SlotGuard<'_>) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    buf.sort_unstable_by(|a, b| compare_keys(entry_key(a), entry_key(b)));

    let file_num = ctx.next_file_id.fetch_add(1, Ordering::Relaxed) + 1;
    let path = ctx.cfg.map_dir.join(format!("{file_num:06}.map"));
    let disk_bytes = write_map_file(&path, &buf, ctx.cfg.partition_buf_sz)?;
    tracing::info!(
        file = %path.display(),
        entries = buf.num_slices(),
        buffered_mib = buf.len_bytes() as f64 / (1024.0 * 1024.0),
        disk_mib = disk_bytes as f64 / (1024.0 * 1024.0),
        "created map file"
    );
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

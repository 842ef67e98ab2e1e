//! Periodic progress reporting and the batch size histogram.

use crate::buffer::SliceBuffer;
use crate::mapper::{MapContext, WriterSlots};
use crate::process::ListReq;
use crossbeam_channel::{select, tick, Receiver};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Log-2 bucketed histogram of record batch sizes.
///
/// Lock-free; every archive-streaming thread records into it and the final
/// summary is logged once the phase completes.
pub(crate) struct SizeHistogram {
    /// One bucket per power of two, index = bit length of the size.
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicU64,
}

impl SizeHistogram {
    pub fn new() -> Self {
        SizeHistogram {
            buckets: (0..=64).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    pub fn record(&self, size: u64) {
        let idx = (64 - size.leading_zeros()) as usize;
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(size, Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.count.load(Ordering::Relaxed) == 0
    }
}

impl fmt::Display for SizeHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return write!(f, "no batches");
        }
        let sum = self.sum.load(Ordering::Relaxed);
        writeln!(f, "batches: {count}, mean size: {} bytes", sum / count)?;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            let n = bucket.load(Ordering::Relaxed);
            if n == 0 {
                continue;
            }
            let lo = if idx == 0 { 0 } else { 1u128 << (idx - 1) };
            let hi = 1u128 << idx;
            writeln!(f, "[{lo}, {hi}): {n}")?;
        }
        Ok(())
    }
}

/// Progress reporter: one line per second while the phase runs, plus a
/// final line when the closer fires.
pub(crate) fn progress_loop(
    ctx: &MapContext,
    req_rx: &Receiver<ListReq>,
    write_rx: &Receiver<SliceBuffer>,
    slots: &WriterSlots,
    done: &Receiver<()>,
) {
    let ticker = tick(Duration::from_secs(1));
    let start = Instant::now();

    let report = || {
        let elapsed = start.elapsed().as_secs_f64();
        let read = ctx.bytes_read.load(Ordering::Relaxed);
        let processed = ctx.bytes_processed.load(Ordering::Relaxed);
        let rate = if elapsed > 0.0 {
            processed as f64 / elapsed
        } else {
            0.0
        };
        tracing::info!(
            elapsed_secs = elapsed as u64,
            req_ch = req_rx.len(),
            write_ch = write_rx.len(),
            read_mib = read as f64 / (1024.0 * 1024.0),
            output_mib = processed as f64 / (1024.0 * 1024.0),
            rate_mib_per_sec = rate / (1024.0 * 1024.0),
            next_file_id = ctx.next_file_id.load(Ordering::Relaxed),
            writers = slots.in_use(),
            "restore map progress"
        );
    };

    loop {
        select! {
            recv(ticker) -> _ => report(),
            recv(done) -> _ => {
                report();
                tracing::info!(
                    elapsed_secs = start.elapsed().as_secs(),
                    "restore map done"
                );
                return;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

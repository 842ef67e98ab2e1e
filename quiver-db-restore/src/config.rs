//! Map phase configuration

use std::path::PathBuf;

/// Partition key sampling interval: one partition key per ~4 MiB of entries.
pub const DEFAULT_PARTITION_BUF_SZ: usize = 4 << 20;

/// Target size of a merged buffer, and therefore of one map file: 2 GiB.
pub const DEFAULT_MAP_FILE_SZ: usize = 2 << 30;

/// Size of the batch buffer filled while streaming one archive: 64 MiB.
pub const DEFAULT_BATCH_BUF_SZ: usize = 64 << 20;

/// Headroom kept below the batch buffer size before shipping it: 2 MiB.
const BATCH_BUF_HEADROOM: usize = 2 << 20;

/// Processor-local spill threshold: ship the entry buffer past ~228 MiB.
pub const DEFAULT_SPILL_SOFT_CAP: usize = 228 << 20;

/// Configuration for the restore map phase.
///
/// The defaults match production sizing; tests shrink them to exercise
/// spills, merges, and partition sampling with small inputs.
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Directory the numbered `.map` files are written to.
    pub map_dir: PathBuf,

    /// Accumulated-entry interval between partition key samples.
    pub partition_buf_sz: usize,

    /// Merge buffer target size. A merger flushes unconditionally at this
    /// size and opportunistically at a quarter of it.
    pub map_file_sz: usize,

    /// Batch buffer capacity used while streaming an archive.
    pub batch_buf_sz: usize,

    /// Processor-local entry buffer threshold before shipping to a merger.
    pub spill_soft_cap: usize,

    /// Processor pool size. 0 derives `max(2, 3/4 × CPU)`.
    pub num_workers: usize,
}

impl MapConfig {
    pub fn new(map_dir: impl Into<PathBuf>) -> Self {
        MapConfig {
            map_dir: map_dir.into(),
            partition_buf_sz: DEFAULT_PARTITION_BUF_SZ,
            map_file_sz: DEFAULT_MAP_FILE_SZ,
            batch_buf_sz: DEFAULT_BATCH_BUF_SZ,
            spill_soft_cap: DEFAULT_SPILL_SOFT_CAP,
            num_workers: 0,
        }
    }

    /// Processor pool size, deriving from the CPU count when unset.
    pub fn effective_workers(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        (cpus * 3 / 4).max(2)
    }

    /// Ship the batch buffer once it crosses this fill level.
    pub fn batch_soft_limit(&self) -> usize {
        self.batch_buf_sz.saturating_sub(BATCH_BUF_HEADROOM)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_workers_floor() {
        let mut cfg = MapConfig::new("/tmp/maps");
        assert!(cfg.effective_workers() >= 2);
        cfg.num_workers = 3;
        assert_eq!(cfg.effective_workers(), 3);
    }

    #[test]
    fn test_batch_soft_limit_stays_positive() {
        let mut cfg = MapConfig::new("/tmp/maps");
        assert!(cfg.batch_soft_limit() < cfg.batch_buf_sz);
        cfg.batch_buf_sz = 1024;
        assert_eq!(cfg.batch_soft_limit(), 0);
    }
}

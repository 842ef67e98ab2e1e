//! Backup manifests and drop operations.
//!
//! A manifest describes one archive in the backup chain: its sequence
//! number, the read timestamp it is valid at, which groups (shards) it
//! covers with which predicates, and the drop operations recorded since the
//! previous backup. Manifest discovery and transport belong to the caller;
//! the planner only consumes the decoded list, ordered newest first.

use crate::error::Result;
use crate::source::RestoreRequest;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A drop recorded in a manifest, applied retroactively to older archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropOp {
    /// Drop everything.
    All,
    /// Drop one namespace's data. An empty value is the pre-2105 spelling of
    /// [`DropOp::All`].
    Data,
    /// Drop one predicate.
    Attr,
    /// Ban one namespace in the live store.
    Ns,
}

/// One drop operation: the kind plus its operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropOperation {
    pub op: DropOp,
    /// Namespace (decimal or `0x` hex) for data/ns drops, namespaced
    /// predicate for attr drops, unused for drop-all.
    #[serde(default)]
    pub value: String,
}

/// Metadata for one archive in the backup chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Position in the backup chain; higher is newer.
    pub backup_num: u64,
    /// Read timestamp the archive was taken at. Zero marks an aborted backup.
    pub since_ts: u64,
    /// Directory of the archive files, relative to the backup location.
    pub path: String,
    /// Predicates per group at the time of this backup.
    pub groups: BTreeMap<u32, Vec<String>>,
    /// Archive compression: `"snappy"`, `"gzip"`, or empty for gzip.
    #[serde(default)]
    pub compression: String,
    /// On-disk format version the archive was written with (0, 2103, 2105…).
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub drop_operations: Vec<DropOperation>,
}

impl Manifest {
    /// The read timestamp this manifest is valid at; zero means skip it.
    pub fn valid_read_ts(&self) -> u64 {
        self.since_ts
    }

    /// Predicates assigned to `gid` at the time of this backup.
    pub fn preds_in_group(&self, gid: u32) -> FxHashSet<String> {
        self.groups
            .get(&gid)
            .map(|preds| preds.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Name of the archive file for one group within a manifest's path.
pub fn backup_file_name(read_ts: u64, gid: u32) -> String {
    format!("r{read_ts}-g{gid}.backup")
}

/// Source of the manifest chain, newest first.
///
/// Implementations list and decode manifests from the backup location; the
/// planner never touches the transport.
pub trait ManifestSource {
    fn manifests(&self, req: &RestoreRequest) -> Result<Vec<Manifest>>;
}

// ============================================================================
// Tests
// ============================================================================

//! # Quiver DB Restore
//!
//! The restore **map phase**: the first stage of the backup-restore
//! pipeline. Given a chain of full + incremental backup archives, it
//! streams each archive, decodes its records, rewrites them into the native
//! key format at the requested restore timestamp (applying historical
//! schema migrations), and writes sorted, partitioned map files to local
//! disk for the reduce phase to merge into the live store.
//!
//! ## Pipeline
//!
//! ```text
//! planner ─→ req_ch ─→ processor pool ─→ write_ch ─→ merger pool ─→ *.map
//! ```
//!
//! The planner walks manifests newest → oldest, maintaining the drop set
//! (dropped predicates/namespaces, drop-all) that later archives impose on
//! earlier ones. Processors decode and transform records in parallel;
//! mergers aggregate spilled buffers, sort them, and write map files under
//! a writer-slot semaphore. See [`run_map_phase`].
//!
//! Collaborators the phase consumes — archive transport, manifest
//! discovery, the live store's namespace ban — are traits in [`source`]
//! and [`manifest`]; the reduce phase is a separate crate.

mod buffer;
pub mod cipher;
pub mod config;
pub mod error;
pub mod manifest;
pub mod map_file;
mod mapper;
pub mod planner;
pub mod process;
mod progress;
pub mod reader;
pub mod source;

pub use config::MapConfig;
pub use error::{RestoreError, Result};
pub use manifest::{backup_file_name, DropOp, DropOperation, Manifest, ManifestSource};
pub use map_file::{entry_data, entry_key, read_map_file, MapHeader};
pub use planner::{run_map_phase, MapResult};
pub use process::LoadDescriptor;
pub use reader::BackupReader;
pub use source::{Credentials, FileHandler, LiveStore, RestoreRequest, UriHandler};

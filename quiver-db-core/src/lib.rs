//! # Quiver DB Core
//!
//! Core data model shared by the Quiver DB storage and backup pipelines.
//!
//! This crate provides:
//! - Native on-disk key encoding, parsing, and ordering (`keys`)
//! - Namespaced attribute conventions and historical rewrites (`attr`)
//! - The backup key/value record wire format (`kv`)
//! - Posting lists: backup form, packed native form, and rollup (`posting`)
//! - Schema and type update records (`schema`)
//!
//! ## Design Principles
//!
//! 1. **Bytewise-sortable keys**: native keys compare correctly with plain
//!    byte comparison; the timestamp suffix is an explicit, separate segment.
//! 2. **Hand-rolled wire formats**: hot-path records are encoded with
//!    explicit little-endian layouts, no reflection or derive machinery.
//! 3. **No I/O**: everything here operates on in-memory byte slices.

pub mod attr;
pub mod error;
pub mod keys;
pub mod kv;
pub mod posting;
pub mod schema;
pub mod wire;

pub use attr::{attr_from_2103, galaxy_attr, namespace_attr, parse_namespace_attr, GALAXY_NS};
pub use error::{Error, Result};
pub use keys::{
    backup_key_from_native, compare_keys, from_backup_key, key_with_ts, parse_key, parse_ts,
    split_key, strip_ts, BackupKey, KeyKind, ParsedKey,
};
pub use kv::{
    Kv, KvList, BIT_COMPLETE_POSTING, BIT_DELTA_POSTING, BIT_EMPTY_POSTING, BIT_SCHEMA_POSTING,
};
pub use posting::{
    marshal_posting_list, rollup, should_split, BackupPostingList, Posting, PostingList, UidPack,
};
pub use schema::{SchemaUpdate, TypeUpdate};

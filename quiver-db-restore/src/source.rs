//! Collaborator interfaces: archive access, credentials, the live store.
//!
//! The map phase reads archives through [`UriHandler`] and reports namespace
//! bans to the [`LiveStore`]. Remote implementations (object stores) live in
//! their own crates; only the filesystem handler ships here.

use crate::error::{RestoreError, Result};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

/// Byte-stream access to archive files under one backup location.
pub trait UriHandler: Send + Sync {
    /// Open `file` (a `/`-separated path relative to the location) for
    /// sequential reading.
    fn stream(&self, file: &str) -> Result<Box<dyn Read + Send>>;
}

/// Filesystem-backed [`UriHandler`] rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileHandler {
    root: PathBuf,
}

impl FileHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileHandler { root: root.into() }
    }
}

impl UriHandler for FileHandler {
    fn stream(&self, file: &str) -> Result<Box<dyn Read + Send>> {
        let mut path = self.root.clone();
        path.extend(file.split('/'));
        Ok(Box::new(File::open(path)?))
    }
}

/// Object-store credentials forwarded to remote handlers.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: String,
    /// Access the location without signing requests.
    pub anonymous: bool,
}

/// A request to restore one group from a backup chain.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Backup location URI, e.g. `file:///backups/prod` or `s3://bucket/path`.
    pub location: String,
    /// Identifier of the backup series under the location.
    pub backup_id: String,
    /// Version every restored record is written at. Must be non-zero.
    pub restore_ts: u64,
    /// The group (shard) this node restores.
    pub group_id: u32,
    /// Skip archives with `backup_num` below this; zero restores the full
    /// chain.
    pub incremental_from: u64,
    /// AES key for encrypted archives; empty means unencrypted.
    pub encryption_key: Vec<u8>,
    pub credentials: Option<Credentials>,
}

impl RestoreRequest {
    /// Validate the parts of the request the map phase depends on.
    pub fn validate(&self) -> Result<()> {
        if self.restore_ts == 0 {
            return Err(RestoreError::config(
                "restore request must carry a non-zero restore_ts",
            ));
        }
        validate_location(&self.location)?;
        Ok(())
    }
}

/// Check that a location URI has a scheme and a non-empty body.
fn validate_location(location: &str) -> Result<()> {
    let Some((scheme, rest)) = location.split_once("://") else {
        return Err(RestoreError::config(format!(
            "backup location {location:?} has no scheme"
        )));
    };
    let scheme_ok = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+.-".contains(c));
    if !scheme_ok || rest.is_empty() {
        return Err(RestoreError::config(format!(
            "backup location {location:?} is not a valid URI"
        )));
    }
    Ok(())
}

/// The live storage engine, as far as the map phase needs it.
///
/// `DROP_NS` operations ban the namespace immediately instead of filtering
/// records, so the store sees the ban even before the reduce phase runs.
pub trait LiveStore: Send + Sync {
    fn ban_namespace(&self, ns: u64) -> Result<()>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn request(location: &str, restore_ts: u64) -> RestoreRequest {
        RestoreRequest {
            location: location.to_owned(),
            backup_id: String::new(),
            restore_ts,
            group_id: 1,
            incremental_from: 0,
            encryption_key: Vec::new(),
            credentials: None,
        }
    }

    #[test]
    fn test_validate_rejects_zero_restore_ts() {
        assert!(request("file:///backups", 0).validate().is_err());
        assert!(request("file:///backups", 5).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_locations() {
        for loc in ["", "backups", "://x", "s3://", "ha!://x"] {
            assert!(request(loc, 5).validate().is_err(), "accepted {loc:?}");
        }
        for loc in ["s3://bucket/x", "file:///var/backups", "minio+http://h/b"] {
            assert!(request(loc, 5).validate().is_ok(), "rejected {loc:?}");
        }
    }

    #[test]
    fn test_file_handler_streams_nested_paths() {
        let dir = std::env::temp_dir().join("quiver_test_file_handler");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("full-1")).unwrap();
        let mut f = std::fs::File::create(dir.join("full-1/r10-g1.backup")).unwrap();
        f.write_all(b"archive bytes").unwrap();

        let handler = FileHandler::new(&dir);
        let mut out = Vec::new();
        handler
            .stream("full-1/r10-g1.backup")
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"archive bytes");
        assert!(handler.stream("full-1/missing").is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}

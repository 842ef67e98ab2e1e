//! Archive reader: transport stream → optional cipher → decompression →
//! length-prefixed batch frames.
//!
//! ## Frame format
//!
//! The decoded stream is a sequence of `u64 LE size || size bytes` frames,
//! each holding one marshalled record batch. EOF on a size read terminates
//! the archive cleanly; EOF anywhere else is a truncation error.

use crate::cipher::DecryptReader;
use crate::error::{RestoreError, Result};
use crate::source::UriHandler;
use flate2::read::GzDecoder;
use snap::read::FrameDecoder;
use std::io::{self, BufReader, Read};

const READ_BUF_SZ: usize = 16 << 10;

/// A fully-wrapped archive stream.
///
/// Dropping the reader releases the wrappers in reverse acquisition order
/// (decompressor, then cipher, then transport) by construction: each layer
/// owns the one beneath it.
pub struct BackupReader {
    inner: BufReader<Box<dyn Read + Send>>,
}

impl std::fmt::Debug for BackupReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupReader").finish_non_exhaustive()
    }
}

impl BackupReader {
    /// Open `file` through `handler` and stack the decrypt/decompress
    /// wrappers the manifest calls for. An empty `compression` means gzip.
    pub fn open(
        handler: &dyn UriHandler,
        file: &str,
        enc_key: &[u8],
        compression: &str,
    ) -> Result<Self> {
        let transport = handler.stream(file)?;
        let transport: Box<dyn Read + Send> = if enc_key.is_empty() {
            transport
        } else {
            Box::new(DecryptReader::new(enc_key, transport)?)
        };
        let decoded: Box<dyn Read + Send> = match compression {
            "snappy" => Box::new(FrameDecoder::new(transport)),
            "gzip" | "" => Box::new(GzDecoder::new(transport)),
            other => return Err(RestoreError::UnknownCompression(other.to_owned())),
        };
        Ok(BackupReader {
            inner: BufReader::with_capacity(READ_BUF_SZ, decoded),
        })
    }

    /// Read the next frame's size. `None` is clean end-of-archive.
    pub fn next_batch_len(&mut self) -> Result<Option<usize>> {
        let mut size = [0u8; 8];
        let mut filled = 0;
        while filled < size.len() {
            match self.inner.read(&mut size[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(RestoreError::decode(
                        "archive truncated inside a frame header",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(u64::from_le_bytes(size) as usize))
    }
}

impl Read for BackupReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

// ============================================================================
// Tests
// ============================================================================

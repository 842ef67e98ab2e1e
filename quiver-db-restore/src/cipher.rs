//! AES-CTR stream decryption for encrypted archives.
//!
//! Encrypted archives start with a 16-byte IV followed by the CTR-encrypted
//! payload. The key length (16/24/32 bytes) selects the AES variant.

use crate::error::{RestoreError, Result};
use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use std::io::{self, Read};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

enum Keystream {
    Aes128(Box<Aes128Ctr>),
    Aes192(Box<Aes192Ctr>),
    Aes256(Box<Aes256Ctr>),
}

impl Keystream {
    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Keystream::Aes128(c) => c.apply_keystream(buf),
            Keystream::Aes192(c) => c.apply_keystream(buf),
            Keystream::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

/// Decrypting wrapper over an archive transport stream.
pub struct DecryptReader<R> {
    inner: R,
    keystream: Keystream,
}

impl<R> std::fmt::Debug for DecryptReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptReader").finish_non_exhaustive()
    }
}

impl<R: Read> DecryptReader<R> {
    /// Read the IV from the head of `inner` and set up the keystream.
    pub fn new(key: &[u8], mut inner: R) -> Result<Self> {
        let mut iv = [0u8; 16];
        inner.read_exact(&mut iv)?;
        let keystream = match key.len() {
            16 => Keystream::Aes128(Box::new(
                Aes128Ctr::new_from_slices(key, &iv).expect("length checked"),
            )),
            24 => Keystream::Aes192(Box::new(
                Aes192Ctr::new_from_slices(key, &iv).expect("length checked"),
            )),
            32 => Keystream::Aes256(Box::new(
                Aes256Ctr::new_from_slices(key, &iv).expect("length checked"),
            )),
            n => {
                return Err(RestoreError::config(format!(
                    "encryption key must be 16, 24, or 32 bytes, got {n}"
                )))
            }
        };
        Ok(DecryptReader { inner, keystream })
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.keystream.apply(&mut buf[..n]);
        Ok(n)
    }
}

// ============================================================================
// Tests
// ============================================================================

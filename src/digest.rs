//! Content digests in `algorithm:hex` form.
//!
//! Only sha256 is produced by this crate, but any `algorithm:hex` string a
//! caller recorded earlier round-trips unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::errors::{Result, StoreError};

/// A content digest such as `sha256:abc123...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Wrap and validate an `algorithm:hex` string.
    pub fn parse(s: &str) -> Result<Self> {
        let Some((algo, encoded)) = s.split_once(':') else {
            return Err(StoreError::InvalidDigest(s.to_string()));
        };
        if algo.is_empty()
            || encoded.is_empty()
            || !encoded.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(StoreError::InvalidDigest(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Compute the sha256 digest of a byte slice.
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_sha256(hasher)
    }

    /// Finalize a sha256 hasher into a digest.
    pub fn from_sha256(hasher: Sha256) -> Self {
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// The algorithm prefix (e.g. `sha256`).
    pub fn algorithm(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    /// The hex-encoded hash without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or("")
    }

    /// The full `algorithm:hex` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An [`std::io::Write`] sink that hashes and counts everything written.
///
/// Used to digest a diff stream in a single pass while something else (a tar
/// reader, a file writer) consumes it.
pub struct DigestWriter {
    hasher: Sha256,
    count: u64,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Bytes written so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Consume the writer and produce the digest of everything written.
    pub fn digest(self) -> Digest {
        Digest::from_sha256(self.hasher)
    }
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::io::Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A reader that copies everything it reads into a side writer.
///
/// This is the synchronous replacement for a pipe-and-thread arrangement:
/// the consumer drives the read loop, and the side writer observes the same
/// bytes.
pub struct TeeReader<R, W> {
    inner: R,
    side: W,
}

impl<R: std::io::Read, W: std::io::Write> TeeReader<R, W> {
    pub fn new(inner: R, side: W) -> Self {
        Self { inner, side }
    }

    /// Drain whatever the consumer left unread, then return the side writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        std::io::copy(&mut self.inner, &mut self.side)?;
        Ok(self.side)
    }
}

impl<R: std::io::Read, W: std::io::Write> std::io::Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.side.write_all(&buf[..n])?;
        Ok(n)
    }
}

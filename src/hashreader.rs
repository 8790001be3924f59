//! A reader which computes the SHA-256 and size of everything read through it.

use std::io::Read;

use anyhow::Result;
use openssl::hash::{Hasher, MessageDigest};

use crate::digest::LayerDigest;

/// SHA-256 block size in bytes.
const SHA256_BLOCK_SIZE: usize = 64;
/// SHA-256 output size in bytes.
const SHA256_OUTPUT_SIZE: usize = 32;

/// Wraps a reader, hashing and counting each byte as it is handed to the consumer.
///
/// The digest is only meaningful as a whole-stream digest once the consumer
/// has read to a clean end of stream. If the underlying reader fails, the
/// error is returned unchanged and the state covers exactly the bytes returned
/// before it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Hasher,
    size: u64,
}

impl<R> std::fmt::Debug for HashingReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashingReader")
            .field("size", &self.size)
            .finish()
    }
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Result<Self> {
        Ok(Self {
            inner,
            hasher: Hasher::new(MessageDigest::sha256())?,
            size: 0,
        })
    }

    /// Bytes read so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reset the digest state. The byte count is not reset and
    /// keeps increasing as further bytes are read.
    pub fn reset(&mut self) -> Result<()> {
        self.hasher = Hasher::new(MessageDigest::sha256())?;
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        SHA256_BLOCK_SIZE
    }

    pub fn output_size(&self) -> usize {
        SHA256_OUTPUT_SIZE
    }

    /// Finalize the digest of all bytes read since creation (or the last
    /// reset). The digest state is reset afterwards.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        Ok(self.hasher.finish()?.to_vec())
    }

    /// Like [`Self::finish`], returning a validated digest.
    pub fn finish_digest(&mut self) -> Result<LayerDigest> {
        LayerDigest::from_bytes(&self.finish()?)
    }

    /// Read (and hash) whatever remains in the underlying stream, returning
    /// the number of bytes that were left.
    pub fn drain(&mut self) -> std::io::Result<u64> {
        std::io::copy(self, &mut std::io::sink())
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Release the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        let chunk = &buf[..n];
        self.hasher.update(chunk)?;
        self.size += n as u64;
        Ok(n)
    }
}

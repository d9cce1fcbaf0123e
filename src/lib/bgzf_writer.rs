//! BGZF block compression for BAM output.
//!
//! [`BlockCompressor`] turns one uncompressed payload into one complete
//! BGZF block, which is what the fast-patch applicator needs to recode a
//! stream block for block. [`BgzfWriter`] layers a buffering `Write`
//! implementation on top for re-serialized output, closing the stream with
//! the EOF marker block.

use std::io::{self, Write};

use bgzf::{CompressionLevel, Compressor};

use crate::bgzf_reader::{BGZF_EOF, BGZF_MAX_UNCOMPRESSED};

/// Maps the user-facing compression level (-1, 0, 1, 9) onto the deflate
/// levels the `bgzf` crate accepts (1-12).
///
/// There is no stored-block mode through this codec, so level 0 maps to
/// the fastest compressing setting.
#[must_use]
pub fn deflate_level(cli_level: i32) -> u8 {
    match cli_level {
        0 | 1 => 1,
        9 => 12,
        _ => 6,
    }
}

/// Compresses single payloads into self-contained BGZF blocks.
pub struct BlockCompressor {
    compressor: Compressor,
}

impl BlockCompressor {
    /// Creates a compressor at the given deflate level (1-12).
    #[must_use]
    pub fn new(level: u8) -> Self {
        let level = CompressionLevel::new(level.clamp(1, 12))
            .unwrap_or_else(|_| CompressionLevel::new(6).expect("default level is valid"));
        Self { compressor: Compressor::new(level) }
    }

    /// Compresses `payload` (at most [`BGZF_MAX_UNCOMPRESSED`] bytes) into
    /// one complete block.
    pub fn compress(&mut self, payload: &[u8]) -> io::Result<Vec<u8>> {
        debug_assert!(payload.len() <= BGZF_MAX_UNCOMPRESSED);
        let mut block = Vec::with_capacity(payload.len() / 2 + 64);
        self.compressor
            .compress(payload, &mut block)
            .map_err(|e| io::Error::other(format!("BGZF deflate failed: {e}")))?;
        Ok(block)
    }

    /// Compresses `payload` into `block`, reusing its allocation.
    pub fn compress_into(&mut self, payload: &[u8], block: &mut Vec<u8>) -> io::Result<()> {
        debug_assert!(payload.len() <= BGZF_MAX_UNCOMPRESSED);
        block.clear();
        self.compressor
            .compress(payload, block)
            .map_err(|e| io::Error::other(format!("BGZF deflate failed: {e}")))
    }
}

/// A buffering BGZF stream writer.
///
/// Data accumulates up to the block payload ceiling, then is compressed and
/// written as one block. [`BgzfWriter::finish`] flushes the tail and appends
/// the EOF marker.
pub struct BgzfWriter<W: Write> {
    /// `None` only after `finish()` has taken the inner writer.
    inner: Option<W>,
    compressor: BlockCompressor,
    buf: Vec<u8>,
    block: Vec<u8>,
}

impl<W: Write> BgzfWriter<W> {
    /// Creates a writer compressing at the given deflate level.
    pub fn new(inner: W, level: u8) -> Self {
        Self {
            inner: Some(inner),
            compressor: BlockCompressor::new(level),
            buf: Vec::with_capacity(BGZF_MAX_UNCOMPRESSED),
            block: Vec::new(),
        }
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.compressor.compress_into(&self.buf, &mut self.block)?;
        if let Some(inner) = self.inner.as_mut() {
            inner.write_all(&self.block)?;
        }
        self.buf.clear();
        Ok(())
    }

    /// Flushes buffered data and writes the EOF marker block.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_block()?;
        let mut inner = self.inner.take().expect("finish() consumes the writer once");
        inner.write_all(&BGZF_EOF)?;
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for BgzfWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = BGZF_MAX_UNCOMPRESSED - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= BGZF_MAX_UNCOMPRESSED {
            self.flush_block()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()?;
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl<W: Write> Drop for BgzfWriter<W> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            let _ = self.flush_block();
            if let Some(inner) = self.inner.as_mut() {
                let _ = inner.write_all(&BGZF_EOF);
                let _ = inner.flush();
            }
        }
    }
}

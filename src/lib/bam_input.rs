//! Streaming BAM input over raw BGZF blocks.
//!
//! Decompresses blocks in batches with libdeflater and parses the binary
//! header (magic, header text, reference directory) followed by raw
//! records. Records are handed out as plain byte vectors; no structured
//! decoding happens on this path.

use std::io::{self, Read, Write};

use libdeflater::Decompressor;

use crate::bgzf_reader::{inflate_into, read_blocks};

/// BGZF blocks decompressed per refill.
const BLOCKS_PER_BATCH: usize = 64;

/// BAM magic bytes.
const BAM_MAGIC: &[u8; 4] = b"BAM\x01";

/// Parsed binary BAM header.
pub struct BamHeader {
    /// The SAM header text.
    pub text: String,
    /// Reference directory as (name, length) pairs.
    pub references: Vec<(String, u32)>,
}

/// Reads raw BAM records from a BGZF-compressed stream.
pub struct BamReader<R: Read> {
    reader: R,
    decompressor: Decompressor,
    decompressed: Vec<u8>,
    position: usize,
    eof: bool,
    header: BamHeader,
}

impl<R: Read> BamReader<R> {
    /// Opens the stream, reading and parsing the BAM header.
    pub fn new(reader: R) -> io::Result<Self> {
        let mut this = Self {
            reader,
            decompressor: Decompressor::new(),
            decompressed: Vec::with_capacity(BLOCKS_PER_BATCH * 65536),
            position: 0,
            eof: false,
            header: BamHeader { text: String::new(), references: Vec::new() },
        };

        if !this.ensure_bytes(4)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream too short to contain BAM magic",
            ));
        }
        if &this.decompressed[0..4] != BAM_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("not a BAM stream: bad magic {:?}", &this.decompressed[0..4]),
            ));
        }
        this.position = 4;
        this.header = this.read_header()?;
        Ok(this)
    }

    fn read_header(&mut self) -> io::Result<BamHeader> {
        let l_text = self.read_u32()? as usize;
        if !self.ensure_bytes(l_text)? {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated BAM header text"));
        }
        let text = String::from_utf8_lossy(&self.decompressed[self.position..self.position + l_text])
            .trim_end_matches('\0')
            .to_string();
        self.position += l_text;

        let n_ref = self.read_u32()? as usize;
        let mut references = Vec::with_capacity(n_ref);
        for _ in 0..n_ref {
            let l_name = self.read_u32()? as usize;
            if !self.ensure_bytes(l_name + 4)? {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated BAM reference directory",
                ));
            }
            let name = String::from_utf8_lossy(
                &self.decompressed[self.position..self.position + l_name.saturating_sub(1)],
            )
            .to_string();
            self.position += l_name;
            let l_ref = self.read_u32()?;
            references.push((name, l_ref));
        }

        Ok(BamHeader { text, references })
    }

    /// The parsed header.
    #[must_use]
    pub fn header(&self) -> &BamHeader {
        &self.header
    }

    /// Reads the next raw record (bytes after the `block_size` prefix).
    ///
    /// Returns `Ok(None)` at end of stream.
    pub fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        if !self.ensure_bytes(4)? {
            return Ok(None);
        }
        let block_size = u32::from_le_bytes([
            self.decompressed[self.position],
            self.decompressed[self.position + 1],
            self.decompressed[self.position + 2],
            self.decompressed[self.position + 3],
        ]) as usize;
        if block_size < 32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid BAM record block size {block_size}"),
            ));
        }
        if !self.ensure_bytes(4 + block_size)? {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated BAM record"));
        }
        let record =
            self.decompressed[self.position + 4..self.position + 4 + block_size].to_vec();
        self.position += 4 + block_size;
        Ok(Some(record))
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        if !self.ensure_bytes(4)? {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated BAM header"));
        }
        let v = u32::from_le_bytes([
            self.decompressed[self.position],
            self.decompressed[self.position + 1],
            self.decompressed[self.position + 2],
            self.decompressed[self.position + 3],
        ]);
        self.position += 4;
        Ok(v)
    }

    fn ensure_bytes(&mut self, n: usize) -> io::Result<bool> {
        while self.position + n > self.decompressed.len() {
            if self.eof {
                return Ok(false);
            }
            self.refill()?;
        }
        Ok(true)
    }

    fn refill(&mut self) -> io::Result<()> {
        if self.position > 0 {
            self.decompressed.copy_within(self.position.., 0);
            let remaining = self.decompressed.len() - self.position;
            self.decompressed.truncate(remaining);
            self.position = 0;
        }

        let blocks = read_blocks(&mut self.reader, BLOCKS_PER_BATCH)?;
        if blocks.is_empty() {
            self.eof = true;
            return Ok(());
        }
        for block in &blocks {
            inflate_into(block, &mut self.decompressor, &mut self.decompressed)?;
        }
        Ok(())
    }
}

/// A reader that mirrors every byte it yields into a writer.
///
/// Used to capture a verbatim copy of the compressed input while the
/// collation pass consumes it. The copy is flushed when the reader drops,
/// so the capture file is complete once the first pass finishes with the
/// stream.
pub struct TeeReader<R: Read, W: Write> {
    inner: R,
    copy: W,
}

impl<R: Read, W: Write> TeeReader<R, W> {
    /// Wraps `inner`, copying all bytes read into `copy`.
    pub fn new(inner: R, copy: W) -> Self {
        Self { inner, copy }
    }
}

impl<R: Read, W: Write> Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.copy.write_all(&buf[..n])?;
        Ok(n)
    }
}

impl<R: Read, W: Write> Drop for TeeReader<R, W> {
    fn drop(&mut self) {
        let _ = self.copy.flush();
    }
}

//! Intermediate alignment stores for stdin input.
//!
//! When the input arrives on a pipe there is nothing to re-read for the
//! second pass, so the collation pass captures every record as it is
//! observed. Three capture shapes exist, mirroring the `--rewrite-bam`
//! modes: a zstd-compressed stream of length-prefixed raw records (mode
//! 0), a re-encoded BAM (mode 1), and a verbatim copy of the compressed
//! input (mode 2, handled by [`crate::bam_input::TeeReader`]). Records are
//! appended in input order, so rank is implicit in the store.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::bgzf_writer::BgzfWriter;
use crate::collator::InputObserver;
use crate::record::RawAlignment;

/// zstd level for the record store; fast wins over tight here.
const STORE_COMPRESSION_LEVEL: i32 = 1;

/// Writes length-prefixed raw records through zstd.
pub struct ZstdStoreWriter {
    encoder: zstd::stream::write::Encoder<'static, BufWriter<File>>,
    count: u64,
}

impl ZstdStoreWriter {
    /// Creates the store file.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        let encoder = zstd::stream::write::Encoder::new(file, STORE_COMPRESSION_LEVEL)?;
        Ok(Self { encoder, count: 0 })
    }

    /// Appends one record.
    pub fn append(&mut self, rec: &RawAlignment) -> io::Result<()> {
        rec.serialize(&mut self.encoder)?;
        self.count += 1;
        Ok(())
    }

    /// Records written.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flushes the zstd frame and the file.
    pub fn finish(self) -> io::Result<()> {
        let mut file = self.encoder.finish()?;
        file.flush()
    }
}

impl InputObserver for ZstdStoreWriter {
    fn observe(&mut self, rec: &RawAlignment) -> io::Result<()> {
        self.append(rec)
    }
}

/// Reads a [`ZstdStoreWriter`] stream back in order.
pub struct ZstdStoreReader {
    decoder: zstd::stream::read::Decoder<'static, BufReader<File>>,
}

impl ZstdStoreReader {
    /// Opens the store file.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self { decoder: zstd::stream::read::Decoder::new(File::open(path)?)? })
    }

    /// The next record's bytes, or `None` at end of store.
    pub fn next_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match self.decoder.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut data = vec![0u8; len];
        self.decoder.read_exact(&mut data)?;
        Ok(Some(data))
    }
}

/// Serializes a binary BAM header (magic, text, reference directory).
pub fn write_bam_header<W: Write + ?Sized>(
    out: &mut W,
    text: &str,
    references: &[(String, u32)],
) -> io::Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    {
        out.write_all(b"BAM\x01")?;
        out.write_all(&(text.len() as u32).to_le_bytes())?;
        out.write_all(text.as_bytes())?;
        out.write_all(&(references.len() as u32).to_le_bytes())?;
        for (name, len) in references {
            out.write_all(&((name.len() + 1) as u32).to_le_bytes())?;
            out.write_all(name.as_bytes())?;
            out.write_all(&[0])?;
            out.write_all(&len.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Captures the input as a re-encoded BAM temp file.
pub struct BamStoreWriter {
    writer: BgzfWriter<BufWriter<File>>,
    count: u64,
}

impl BamStoreWriter {
    /// Creates the temp BAM with the given (unaugmented) header.
    pub fn create(
        path: &Path,
        header_text: &str,
        references: &[(String, u32)],
        level: u8,
    ) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        let mut writer = BgzfWriter::new(file, level);
        write_bam_header(&mut writer, header_text, references)?;
        Ok(Self { writer, count: 0 })
    }

    /// Records written.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flushes the BGZF stream and closes the file.
    pub fn finish(self) -> io::Result<()> {
        self.writer.finish().map(|_| ())
    }
}

impl InputObserver for BamStoreWriter {
    fn observe(&mut self, rec: &RawAlignment) -> io::Result<()> {
        rec.serialize(&mut self.writer)?;
        self.count += 1;
        Ok(())
    }
}

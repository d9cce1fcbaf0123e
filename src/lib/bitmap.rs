//! Duplicate rank sinks: the dense bitmap and the streamed-rank spill.
//!
//! The rule engine records duplicate decisions by input rank. The dense
//! bitmap is the default sink; the spill variant streams ranks to a temp
//! file and materializes the bitmap at finalize time, which wins when the
//! expected duplicate count is small next to the alignment count.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

/// Anything that can accept duplicate ranks.
pub trait DupRankSink {
    /// Records `rank` as a duplicate.
    fn set(&mut self, rank: u64) -> io::Result<()>;
}

/// A dense bit vector indexed by input rank.
pub struct DupBitmap {
    words: Vec<u64>,
    len: u64,
}

impl DupBitmap {
    /// Creates an all-zero bitmap covering `len` ranks.
    #[must_use]
    pub fn new(len: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let word_count = len.div_ceil(64) as usize;
        Self { words: vec![0; word_count], len }
    }

    /// Number of ranks covered.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the bitmap covers zero ranks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `rank` is marked.
    #[must_use]
    pub fn get(&self, rank: u64) -> bool {
        if rank >= self.len {
            return false;
        }
        #[allow(clippy::cast_possible_truncation)]
        let word = (rank / 64) as usize;
        self.words[word] & (1 << (rank % 64)) != 0
    }

    /// Number of marked ranks.
    #[must_use]
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }
}

impl DupRankSink for DupBitmap {
    fn set(&mut self, rank: u64) -> io::Result<()> {
        if rank >= self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rank {rank} outside bitmap of {} ranks", self.len),
            ));
        }
        #[allow(clippy::cast_possible_truncation)]
        let word = (rank / 64) as usize;
        self.words[word] |= 1 << (rank % 64);
        Ok(())
    }
}

/// Streams duplicate ranks to a file, materializing a bitmap on demand.
pub struct RankSpill {
    path: PathBuf,
    writer: BufWriter<File>,
    count: u64,
}

impl RankSpill {
    /// Creates the spill file.
    pub fn create(path: PathBuf) -> io::Result<Self> {
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self { path, writer, count: 0 })
    }

    /// Ranks streamed so far (marks, not distinct ranks).
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Reads the streamed ranks back into a dense bitmap of `len` ranks.
    pub fn finalize(mut self, len: u64) -> io::Result<DupBitmap> {
        self.writer.flush()?;
        drop(self.writer);

        let mut bitmap = DupBitmap::new(len);
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut buf = [0u8; 8];
        loop {
            match reader.read_exact(&mut buf) {
                Ok(()) => bitmap.set(u64::from_le_bytes(buf))?,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }
        Ok(bitmap)
    }
}

impl DupRankSink for RankSpill {
    fn set(&mut self, rank: u64) -> io::Result<()> {
        self.count += 1;
        self.writer.write_all(&rank.to_le_bytes())
    }
}

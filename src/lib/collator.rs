//! Single-pass mate collation.
//!
//! Pairs arrive in arbitrary order in the input; the collator holds the
//! first-seen mate of each pair in a name-hashed table and emits the pair
//! the moment the second mate shows up. Table pressure (a colliding name,
//! or the configured spill budget) pushes the oldest occupant out to a
//! spill file; after the input ends the spilled records are merged back in
//! name order and paired there.
//!
//! Observers registered with [`Collator::put`] run exactly once per
//! record, in input order, before the record can enter the table.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fs::File;
use std::hash::{BuildHasher, Hasher};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use ahash::RandomState;

use crate::record::RawAlignment;

/// Collator tuning knobs.
pub struct CollatorConfig {
    /// log2 of the hash table slot count.
    pub hash_bits: u32,
    /// Spill run buffer budget in bytes.
    pub spill_buffer_bytes: usize,
}

impl Default for CollatorConfig {
    fn default() -> Self {
        Self { hash_bits: 20, spill_buffer_bytes: 32 * 1024 * 1024 }
    }
}

/// One collated output: a completed mate pair, or a record with no mate to
/// wait for.
pub enum Collated {
    /// A record that does not participate in pairing (unpaired flag, or
    /// secondary/supplementary), or whose mate never arrived.
    Single(RawAlignment),
    /// Both mates of one template.
    Pair(RawAlignment, RawAlignment),
}

/// Callback invoked for every record in input order.
pub trait InputObserver {
    /// Observes one record before it enters the collation table. The
    /// record must not be retained past the call.
    fn observe(&mut self, rec: &RawAlignment) -> io::Result<()>;
}

/// The streaming mate collator.
pub struct Collator {
    table: Vec<Option<RawAlignment>>,
    mask: u64,
    hasher: RandomState,
    run_buffer: Vec<RawAlignment>,
    run_buffer_bytes: usize,
    spill_buffer_bytes: usize,
    spill_path: PathBuf,
    spill_writer: Option<BufWriter<File>>,
    spill_runs: Vec<(u64, u64)>,
    spilled: u64,
}

impl Collator {
    /// Creates a collator spilling to `spill_path`.
    #[must_use]
    pub fn new(spill_path: PathBuf, config: &CollatorConfig) -> Self {
        let slots = 1usize << config.hash_bits;
        Self {
            table: vec![None; slots],
            mask: (slots - 1) as u64,
            hasher: RandomState::new(),
            run_buffer: Vec::new(),
            run_buffer_bytes: 0,
            spill_buffer_bytes: config.spill_buffer_bytes,
            spill_path,
            spill_writer: None,
            spill_runs: Vec::new(),
            spilled: 0,
        }
    }

    /// Records pushed out to the spill file.
    #[must_use]
    pub fn spilled(&self) -> u64 {
        self.spilled
    }

    /// Feeds one record through the observers and into the table.
    ///
    /// Returns a completed pair when this record's mate was already
    /// waiting, or the record itself when it cannot pair.
    pub fn put(
        &mut self,
        rec: RawAlignment,
        observers: &mut [&mut dyn InputObserver],
    ) -> io::Result<Option<Collated>> {
        for observer in observers.iter_mut() {
            observer.observe(&rec)?;
        }

        if !rec.is_paired() || rec.is_secondary_or_supplementary() {
            return Ok(Some(Collated::Single(rec)));
        }

        #[allow(clippy::cast_possible_truncation)]
        let slot = (self.name_hash(rec.name()) & self.mask) as usize;
        match self.table[slot].take() {
            None => {
                self.table[slot] = Some(rec);
                Ok(None)
            }
            Some(pending) => {
                if pending.name() == rec.name() && pending.is_read1() != rec.is_read1() {
                    Ok(Some(Collated::Pair(pending, rec)))
                } else {
                    self.expunge(pending)?;
                    self.table[slot] = Some(rec);
                    Ok(None)
                }
            }
        }
    }

    fn name_hash(&self, name: &[u8]) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        hasher.write(name);
        hasher.finish()
    }

    fn expunge(&mut self, rec: RawAlignment) -> io::Result<()> {
        self.run_buffer_bytes += rec.as_bytes().len() + 12;
        self.run_buffer.push(rec);
        self.spilled += 1;
        if self.run_buffer_bytes >= self.spill_buffer_bytes {
            self.spill_run()?;
        }
        Ok(())
    }

    fn spill_run(&mut self) -> io::Result<()> {
        if self.run_buffer.is_empty() {
            return Ok(());
        }
        self.run_buffer.sort_by(|a, b| a.name().cmp(b.name()).then(a.rank().cmp(&b.rank())));

        if self.spill_writer.is_none() {
            self.spill_writer = Some(BufWriter::new(File::create(&self.spill_path)?));
        }
        let writer = self.spill_writer.as_mut().expect("writer created above");

        let offset = match self.spill_runs.last() {
            Some(&(off, bytes)) => off + bytes,
            None => 0,
        };
        let mut written = 0u64;
        for rec in &self.run_buffer {
            writer.write_all(&rec.rank().to_le_bytes())?;
            #[allow(clippy::cast_possible_truncation)]
            writer.write_all(&(rec.as_bytes().len() as u32).to_le_bytes())?;
            writer.write_all(rec.as_bytes())?;
            written += 12 + rec.as_bytes().len() as u64;
        }
        self.spill_runs.push((offset, written));
        self.run_buffer.clear();
        self.run_buffer_bytes = 0;
        Ok(())
    }

    /// Ends the input: residual table entries and spilled records merge in
    /// name order, pairing where both mates are present.
    pub fn finish(mut self) -> io::Result<CollatorDrain> {
        let residue: Vec<RawAlignment> = self.table.iter_mut().filter_map(Option::take).collect();
        for rec in residue {
            // Residual entries go through the same spill path so the merge
            // sees one uniform record stream.
            self.run_buffer_bytes += rec.as_bytes().len() + 12;
            self.run_buffer.push(rec);
        }
        self.spill_run()?;
        if let Some(writer) = self.spill_writer.as_mut() {
            writer.flush()?;
        }
        drop(self.spill_writer.take());

        let mut cursors = Vec::with_capacity(self.spill_runs.len());
        for &(offset, bytes) in &self.spill_runs {
            let mut file = File::open(&self.spill_path)?;
            file.seek(SeekFrom::Start(offset))?;
            cursors.push(SpillCursor {
                reader: BufReader::new(file),
                remaining_bytes: bytes,
            });
        }

        let mut heap = BinaryHeap::with_capacity(cursors.len());
        for (idx, cursor) in cursors.iter_mut().enumerate() {
            if let Some(rec) = cursor.next()? {
                heap.push(Reverse(MergeEntry::new(rec, idx)));
            }
        }

        Ok(CollatorDrain { cursors, heap, pending: VecDeque::new() })
    }
}

struct SpillCursor {
    reader: BufReader<File>,
    remaining_bytes: u64,
}

impl SpillCursor {
    fn next(&mut self) -> io::Result<Option<RawAlignment>> {
        if self.remaining_bytes == 0 {
            return Ok(None);
        }
        let mut rank_buf = [0u8; 8];
        self.reader.read_exact(&mut rank_buf)?;
        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data)?;
        self.remaining_bytes -= 12 + len as u64;
        RawAlignment::new(data, u64::from_le_bytes(rank_buf)).map(Some)
    }
}

struct MergeEntry {
    name: Vec<u8>,
    rank: u64,
    rec: RawAlignment,
    run: usize,
}

impl MergeEntry {
    fn new(rec: RawAlignment, run: usize) -> Self {
        Self { name: rec.name().to_vec(), rank: rec.rank(), rec, run }
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.rank == other.rank
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name).then(self.rank.cmp(&other.rank))
    }
}

/// Streams the post-input residue: pairs where both mates surfaced in the
/// spill, singles otherwise.
pub struct CollatorDrain {
    cursors: Vec<SpillCursor>,
    heap: BinaryHeap<Reverse<MergeEntry>>,
    pending: VecDeque<Collated>,
}

impl CollatorDrain {
    /// The next collated output, or `None` when drained.
    pub fn next(&mut self) -> io::Result<Option<Collated>> {
        loop {
            if let Some(out) = self.pending.pop_front() {
                return Ok(Some(out));
            }
            if !self.pull_group()? {
                return Ok(None);
            }
        }
    }

    fn pop_entry(&mut self) -> io::Result<Option<MergeEntry>> {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(rec) = self.cursors[entry.run].next()? {
            self.heap.push(Reverse(MergeEntry::new(rec, entry.run)));
        }
        Ok(Some(entry))
    }

    /// Collects all records sharing the next name and pairs them up.
    fn pull_group(&mut self) -> io::Result<bool> {
        let Some(first) = self.pop_entry()? else {
            return Ok(false);
        };
        let name = first.name.clone();
        let mut group = vec![first.rec];
        while self.heap.peek().is_some_and(|Reverse(e)| e.name == name) {
            let entry = self.pop_entry()?.expect("peeked entry exists");
            group.push(entry.rec);
        }

        let (read1s, read2s): (Vec<RawAlignment>, Vec<RawAlignment>) =
            group.into_iter().partition(RawAlignment::is_read1);
        let mut read2s = read2s.into_iter();
        for r1 in read1s {
            match read2s.next() {
                Some(r2) => self.pending.push_back(Collated::Pair(r1, r2)),
                None => self.pending.push_back(Collated::Single(r1)),
            }
        }
        for r2 in read2s {
            self.pending.push_back(Collated::Single(r2));
        }
        Ok(true)
    }
}

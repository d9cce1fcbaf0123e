//! External-sort container for read-end signatures.
//!
//! Signatures accumulate in memory up to the configured buffer size; a
//! full buffer is sorted and appended to the container's temp file as one
//! run. Closing the container merges all runs through a binary heap of
//! per-run cursors, yielding the signatures in global signature order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;

use rayon::prelude::*;

use crate::read_ends::{ENCODED_SIZE, ReadEnds};

/// Buffer size for run readers during the merge.
const MERGE_BUFFER_SIZE: usize = 64 * 1024;

/// An append-only store of read-end signatures with spill-to-disk sorting.
pub struct ReadEndsContainer {
    buffer: Vec<ReadEnds>,
    max_buffered: usize,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    runs: Vec<(u64, u64)>,
    parallel_sort: bool,
    total: u64,
}

impl ReadEndsContainer {
    /// Creates a container spilling runs to `path` once the in-memory
    /// buffer would exceed `buffer_bytes`.
    #[must_use]
    pub fn new(path: PathBuf, buffer_bytes: usize, parallel_sort: bool) -> Self {
        let max_buffered = (buffer_bytes / ENCODED_SIZE).max(1);
        Self {
            buffer: Vec::with_capacity(max_buffered.min(1 << 20)),
            max_buffered,
            path,
            writer: None,
            runs: Vec::new(),
            parallel_sort,
            total: 0,
        }
    }

    /// Appends one signature, spilling a sorted run when the buffer fills.
    pub fn put(&mut self, ends: ReadEnds) -> io::Result<()> {
        self.buffer.push(ends);
        self.total += 1;
        if self.buffer.len() >= self.max_buffered {
            self.spill_run()?;
        }
        Ok(())
    }

    /// Writes the tail run, leaving the container ready for decoding.
    pub fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.spill_run()?;
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Total signatures appended.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.total
    }

    /// Whether nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn spill_run(&mut self) -> io::Result<()> {
        if self.parallel_sort {
            self.buffer.par_sort_unstable();
        } else {
            self.buffer.sort_unstable();
        }

        if self.writer.is_none() {
            let file = File::create(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        let writer = self.writer.as_mut().expect("writer created above");

        let offset = self.runs.last().map_or(0, |(off, count)| {
            off + count * ENCODED_SIZE as u64
        });
        for ends in &self.buffer {
            ends.encode(writer)?;
        }
        self.runs.push((offset, self.buffer.len() as u64));
        self.buffer.clear();
        Ok(())
    }

    /// Finishes writing and returns a merging decoder over all runs.
    pub fn into_decoder(mut self) -> io::Result<SortedEndsDecoder> {
        self.flush()?;
        drop(self.writer.take());

        let mut cursors = Vec::with_capacity(self.runs.len());
        for &(offset, count) in &self.runs {
            let mut file = File::open(&self.path)?;
            file.seek(SeekFrom::Start(offset))?;
            cursors.push(RunCursor {
                reader: BufReader::with_capacity(MERGE_BUFFER_SIZE, file),
                remaining: count,
            });
        }

        let mut heap = BinaryHeap::with_capacity(cursors.len());
        for (idx, cursor) in cursors.iter_mut().enumerate() {
            if let Some(ends) = cursor.next()? {
                heap.push(Reverse(HeapEntry { ends, run: idx }));
            }
        }

        Ok(SortedEndsDecoder { cursors, heap })
    }
}

struct RunCursor {
    reader: BufReader<File>,
    remaining: u64,
}

impl RunCursor {
    fn next(&mut self) -> io::Result<Option<ReadEnds>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        ReadEnds::decode(&mut self.reader)
    }
}

struct HeapEntry {
    ends: ReadEnds,
    run: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ends == other.ends
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ends.cmp(&other.ends)
    }
}

/// Streams signatures from all runs in merged signature order.
pub struct SortedEndsDecoder {
    cursors: Vec<RunCursor>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl SortedEndsDecoder {
    /// The next signature in sorted order, or `None` when drained.
    pub fn next(&mut self) -> io::Result<Option<ReadEnds>> {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(next) = self.cursors[entry.run].next()? {
            self.heap.push(Reverse(HeapEntry { ends: next, run: entry.run }));
        }
        Ok(Some(entry.ends))
    }
}

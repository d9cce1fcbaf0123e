//! Position-window tracking of simple pairs.
//!
//! A "simple pair" has both mates mapped to one reference on opposite
//! strands with the reverse mate downstream. For those, emission into the
//! pair container is deferred: pairs collect in a coordinate bucket keyed
//! by the reverse mate's (ref, 5' coordinate), and the bucket is released
//! only once every pair counted into it has been collected and the input
//! has moved past its coordinate. Buffering by bucket keeps near-sorted
//! input from interleaving pairs of one coordinate across container runs.
//!
//! Pair cells live in a fixed arena threaded by an intrusive free list;
//! running out of cells expunges the oldest bucket wholesale.

use std::collections::VecDeque;
use std::io;

use crate::ends_container::ReadEndsContainer;
use crate::header::LibraryTable;
use crate::read_ends::ReadEnds;
use crate::record::RawAlignment;

/// Pair cells available before bucket expunge kicks in.
pub const FREELIST_SIZE: usize = 4096;

/// Sentinel terminating a bucket's cell chain.
const NIL: u32 = u32::MAX;

struct PairCell {
    a: RawAlignment,
    b: RawAlignment,
    next: u32,
}

struct ActiveBucket {
    ref_id: i32,
    coord: i32,
    incnt: u64,
    outcnt: u64,
    head: u32,
}

/// Tracks active coordinate buckets over the input stream.
pub struct PositionTracker {
    /// (ref, pos) of the most recent input record.
    position: (i32, i32),
    /// Latest coordinate whose bucket was expunged; pairs at or before it
    /// bypass tracking.
    expunge_position: (i32, i32),
    active: VecDeque<ActiveBucket>,
    cells: Vec<Option<PairCell>>,
    free: Vec<u32>,
    /// Pairs expunged to the container before their bucket settled.
    pub excnt: u64,
    /// Pairs emitted from finished buckets.
    pub fincnt: u64,
    /// Non-simple ("straddling") pairs routed directly to the container.
    pub strcnt: u64,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionTracker {
    /// Creates a tracker with an empty arena.
    #[must_use]
    pub fn new() -> Self {
        let mut cells = Vec::with_capacity(FREELIST_SIZE);
        cells.resize_with(FREELIST_SIZE, || None);
        #[allow(clippy::cast_possible_truncation)]
        let free: Vec<u32> = (0..FREELIST_SIZE as u32).collect();
        Self {
            position: (-1, -1),
            expunge_position: (-1, -1),
            active: VecDeque::new(),
            cells,
            free,
            excnt: 0,
            fincnt: 0,
            strcnt: 0,
        }
    }

    /// Whether `rec` belongs to a simple pair: both mates mapped to the
    /// same reference, opposite strands, reverse mate strictly downstream.
    #[must_use]
    pub fn is_simple_pair(rec: &RawAlignment) -> bool {
        if !rec.is_paired() || rec.is_unmapped() || rec.is_mate_unmapped() {
            return false;
        }
        if rec.ref_id() != rec.mate_ref_id() {
            return false;
        }
        match (rec.is_reverse(), rec.is_mate_reverse()) {
            (true, false) => rec.mate_pos() < rec.pos(),
            (false, true) => rec.pos() < rec.mate_pos(),
            _ => false,
        }
    }

    /// Input-order callback: advances the stream position, and counts the
    /// reverse mate of each simple pair into its coordinate bucket.
    pub fn update_position(&mut self, rec: &RawAlignment) {
        self.position = (rec.ref_id(), rec.pos());

        if rec.is_secondary_or_supplementary()
            || !Self::is_simple_pair(rec)
            || !rec.is_reverse()
        {
            return;
        }

        let key = (rec.ref_id(), rec.coordinate());
        // Common case: coordinates arrive in order, the bucket is at the
        // tail or needs appending there.
        let back_key = self.active.back().map(|b| (b.ref_id, b.coord));
        match back_key {
            None => self.push_bucket(self.active.len(), key),
            Some(back) if back == key => {
                self.active.back_mut().expect("nonempty deque").incnt += 1;
            }
            Some(back) if back < key => self.push_bucket(self.active.len(), key),
            Some(_) => {
                let idx = self.lower_bound(key);
                if idx < self.active.len()
                    && (self.active[idx].ref_id, self.active[idx].coord) == key
                {
                    self.active[idx].incnt += 1;
                } else {
                    self.push_bucket(idx, key);
                }
            }
        }
    }

    fn push_bucket(&mut self, index: usize, key: (i32, i32)) {
        let bucket =
            ActiveBucket { ref_id: key.0, coord: key.1, incnt: 1, outcnt: 0, head: NIL };
        if index == self.active.len() {
            self.active.push_back(bucket);
        } else {
            self.active.insert(index, bucket);
        }
    }

    fn lower_bound(&self, key: (i32, i32)) -> usize {
        let mut lo = 0;
        let mut hi = self.active.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if (self.active[mid].ref_id, self.active[mid].coord) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Accepts a collected simple pair, `b` being the reverse mate.
    ///
    /// The pair lands in its coordinate bucket when that region is still
    /// active, otherwise it goes straight to the container.
    pub fn add_pair(
        &mut self,
        a: RawAlignment,
        b: RawAlignment,
        pairs: &mut ReadEndsContainer,
        libraries: &LibraryTable,
    ) -> io::Result<()> {
        let key = (b.ref_id(), b.coordinate());
        loop {
            if key <= self.expunge_position {
                // Region already handled; this pair is too late to buffer.
                pairs.put(ReadEnds::pair(&a, &b, libraries))?;
                self.excnt += 1;
                return Ok(());
            }

            if let Some(cell_idx) = self.free.pop() {
                let idx = self.lower_bound(key);
                if idx >= self.active.len()
                    || (self.active[idx].ref_id, self.active[idx].coord) != key
                {
                    // No bucket was counted for this coordinate; emit
                    // directly rather than hold an unfinishable cell.
                    self.free.push(cell_idx);
                    pairs.put(ReadEnds::pair(&a, &b, libraries))?;
                    self.excnt += 1;
                    return Ok(());
                }
                let bucket = &mut self.active[idx];
                self.cells[cell_idx as usize] =
                    Some(PairCell { a, b, next: bucket.head });
                bucket.head = cell_idx;
                bucket.outcnt += 1;
                return Ok(());
            }

            self.expunge_front(pairs, libraries)?;
            self.check_finished(pairs, libraries)?;
        }
    }

    /// Releases every leading bucket whose pairs are all collected and
    /// whose coordinate the input has moved past.
    pub fn check_finished(
        &mut self,
        pairs: &mut ReadEndsContainer,
        libraries: &LibraryTable,
    ) -> io::Result<()> {
        while let Some(front) = self.active.front() {
            let passed = self.position > (front.ref_id, front.coord);
            if passed && front.incnt == front.outcnt {
                self.finish_front(pairs, libraries)?;
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Drains every remaining bucket at end of input.
    pub fn flush(
        &mut self,
        pairs: &mut ReadEndsContainer,
        libraries: &LibraryTable,
    ) -> io::Result<()> {
        while let Some(front) = self.active.front() {
            if front.incnt == front.outcnt {
                self.finish_front(pairs, libraries)?;
            } else {
                log::warn!(
                    "expunging unsettled bucket ({}, {}) at flush: {} counted, {} collected",
                    front.ref_id,
                    front.coord,
                    front.incnt,
                    front.outcnt
                );
                self.expunge_front(pairs, libraries)?;
            }
        }
        Ok(())
    }

    fn finish_front(
        &mut self,
        pairs: &mut ReadEndsContainer,
        libraries: &LibraryTable,
    ) -> io::Result<()> {
        let bucket = self.active.pop_front().expect("caller checked front");
        self.fincnt += self.drain_chain(bucket.head, pairs, libraries)?;
        Ok(())
    }

    fn expunge_front(
        &mut self,
        pairs: &mut ReadEndsContainer,
        libraries: &LibraryTable,
    ) -> io::Result<()> {
        let bucket = self.active.pop_front().expect("caller checked front");
        self.expunge_position = (bucket.ref_id, bucket.coord);
        self.excnt += self.drain_chain(bucket.head, pairs, libraries)?;
        Ok(())
    }

    fn drain_chain(
        &mut self,
        head: u32,
        pairs: &mut ReadEndsContainer,
        libraries: &LibraryTable,
    ) -> io::Result<u64> {
        let mut idx = head;
        let mut emitted = 0;
        while idx != NIL {
            let cell = self.cells[idx as usize].take().expect("chained cell is live");
            pairs.put(ReadEnds::pair(&cell.a, &cell.b, libraries))?;
            self.free.push(idx);
            idx = cell.next;
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Live buckets (diagnostics).
    #[must_use]
    pub fn active_buckets(&self) -> usize {
        self.active.len()
    }
}

impl crate::collator::InputObserver for PositionTracker {
    fn observe(&mut self, rec: &RawAlignment) -> io::Result<()> {
        self.update_position(rec);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FLAG_MATE_REVERSE, FLAG_PAIRED, FLAG_READ1, FLAG_READ2, FLAG_REVERSE};
    use crate::test_support::RecordBuilder;
    use tempfile::TempDir;

    fn libraries() -> LibraryTable {
        LibraryTable::from_header_text("")
    }

    fn simple_pair(name: &str, fwd_pos: i32, rev_pos: i32, ranks: (u64, u64)) -> (RawAlignment, RawAlignment) {
        let fwd = RecordBuilder::new(name)
            .pos(fwd_pos)
            .mate_ref_id(0)
            .mate_pos(rev_pos)
            .flags(FLAG_PAIRED | FLAG_READ1 | FLAG_MATE_REVERSE)
            .cigar(&[(10, b'M')])
            .rank(ranks.0)
            .build();
        let rev = RecordBuilder::new(name)
            .pos(rev_pos)
            .mate_ref_id(0)
            .mate_pos(fwd_pos)
            .flags(FLAG_PAIRED | FLAG_READ2 | FLAG_REVERSE)
            .cigar(&[(10, b'M')])
            .rank(ranks.1)
            .build();
        (fwd, rev)
    }

    fn drain_count(container: ReadEndsContainer) -> u64 {
        let mut decoder = container.into_decoder().unwrap();
        let mut n = 0;
        while decoder.next().unwrap().is_some() {
            n += 1;
        }
        n
    }

    #[test]
    fn test_simple_pair_detection() {
        let (fwd, rev) = simple_pair("q", 100, 300, (0, 1));
        assert!(PositionTracker::is_simple_pair(&fwd));
        assert!(PositionTracker::is_simple_pair(&rev));

        // Same strand: not simple.
        let same_strand = RecordBuilder::new("q")
            .pos(100)
            .mate_ref_id(0)
            .mate_pos(300)
            .flags(FLAG_PAIRED)
            .cigar(&[(10, b'M')])
            .build();
        assert!(!PositionTracker::is_simple_pair(&same_strand));

        // Outie (reverse end upstream): not simple.
        let outie = RecordBuilder::new("q")
            .pos(300)
            .mate_ref_id(0)
            .mate_pos(100)
            .flags(FLAG_PAIRED | FLAG_MATE_REVERSE)
            .cigar(&[(10, b'M')])
            .build();
        assert!(!PositionTracker::is_simple_pair(&outie));
    }

    #[test]
    fn test_bucket_finishes_when_position_passes() {
        let dir = TempDir::new().unwrap();
        let libs = libraries();
        let mut pairs = ReadEndsContainer::new(dir.path().join("pairs"), 1 << 20, false);
        let mut tracker = PositionTracker::new();

        let (fwd, rev) = simple_pair("q", 100, 300, (0, 1));
        tracker.update_position(&fwd);
        tracker.update_position(&rev);
        tracker.add_pair(fwd, rev, &mut pairs, &libs).unwrap();
        tracker.check_finished(&mut pairs, &libs).unwrap();
        // Position (0, 300) has not passed the bucket coordinate 309.
        assert_eq!(tracker.active_buckets(), 1);

        let later = RecordBuilder::new("later").pos(5000).cigar(&[(10, b'M')]).build();
        tracker.update_position(&later);
        tracker.check_finished(&mut pairs, &libs).unwrap();
        assert_eq!(tracker.active_buckets(), 0);
        assert_eq!(tracker.fincnt, 1);
        assert_eq!(drain_count(pairs), 1);
    }

    #[test]
    fn test_flush_emits_unfinished_front() {
        let dir = TempDir::new().unwrap();
        let libs = libraries();
        let mut pairs = ReadEndsContainer::new(dir.path().join("pairs"), 1 << 20, false);
        let mut tracker = PositionTracker::new();

        let (fwd, rev) = simple_pair("q", 100, 300, (0, 1));
        tracker.update_position(&fwd);
        tracker.update_position(&rev);
        tracker.add_pair(fwd, rev, &mut pairs, &libs).unwrap();

        tracker.flush(&mut pairs, &libs).unwrap();
        assert_eq!(tracker.active_buckets(), 0);
        assert_eq!(tracker.fincnt, 1);
        assert_eq!(drain_count(pairs), 1);
    }

    #[test]
    fn test_freelist_exhaustion_expunges() {
        let dir = TempDir::new().unwrap();
        let libs = libraries();
        let mut pairs = ReadEndsContainer::new(dir.path().join("pairs"), 1 << 20, false);
        let mut tracker = PositionTracker::new();

        // More live pairs than the arena holds, all at distinct coords.
        // The reverse mates stream by first (creating the buckets), then
        // the forward mates complete each pair while the input position
        // sits upstream of every bucket coordinate, so nothing can finish
        // until the arena runs dry.
        let n = FREELIST_SIZE as i32 + 900;
        let mut reverse_mates = Vec::new();
        let mut forward_mates = Vec::new();
        for i in 0..n {
            let name = format!("p{i}");
            let (fwd, rev) =
                simple_pair(&name, 100 + i, 100_000 + i, (2 * i as u64, 2 * i as u64 + 1));
            forward_mates.push(fwd);
            reverse_mates.push(rev);
        }
        for rev in &reverse_mates {
            tracker.update_position(rev);
        }
        for (fwd, rev) in forward_mates.into_iter().zip(reverse_mates) {
            tracker.update_position(&fwd);
            tracker.add_pair(fwd, rev, &mut pairs, &libs).unwrap();
            tracker.check_finished(&mut pairs, &libs).unwrap();
        }
        tracker.flush(&mut pairs, &libs).unwrap();

        assert!(tracker.excnt > 0, "arena exhaustion must expunge");
        assert_eq!(tracker.excnt + tracker.fincnt, n as u64);
        assert_eq!(drain_count(pairs), n as u64);
    }

    #[test]
    fn test_pair_behind_expunge_position_bypasses() {
        let dir = TempDir::new().unwrap();
        let libs = libraries();
        let mut pairs = ReadEndsContainer::new(dir.path().join("pairs"), 1 << 20, false);
        let mut tracker = PositionTracker::new();
        tracker.expunge_position = (0, 1_000_000);

        let (fwd, rev) = simple_pair("late", 100, 300, (0, 1));
        tracker.add_pair(fwd, rev, &mut pairs, &libs).unwrap();
        assert_eq!(tracker.excnt, 1);
        assert_eq!(tracker.active_buckets(), 0);
    }

    #[test]
    fn test_mid_deque_bucket_insert() {
        let mut tracker = PositionTracker::new();
        // Coordinates arrive out of order: 500, 100, 300.
        for pos in [500, 100, 300] {
            let (_, rev) = simple_pair(&format!("q{pos}"), 10, pos, (0, 1));
            tracker.update_position(&rev);
        }
        assert_eq!(tracker.active_buckets(), 3);
        let coords: Vec<i32> = tracker.active.iter().map(|b| b.coord).collect();
        assert_eq!(coords, vec![109, 309, 509]);
    }
}

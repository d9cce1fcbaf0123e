//! Read-end signatures: the projection of one or two alignments onto the
//! fields that decide duplicate equivalence.
//!
//! A fragment signature covers a single mapped read; a pair signature
//! covers a canonicalized mate pair. Signatures are what flows through the
//! external-sort containers, so they carry everything the rule engine
//! needs: the equivalence key, the score, the tie-breaking ranks, and the
//! flow-cell location for optical detection.

use std::cmp::Ordering;
use std::io::{self, Read, Write};

use crate::header::LibraryTable;
use crate::record::RawAlignment;

/// Strand arrangement of a signature.
///
/// `F`/`R` for fragments; `FF`/`FR`/`RF`/`RR` for pairs, read off the two
/// ends after canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Orientation {
    /// Forward fragment.
    F = 0,
    /// Reverse fragment.
    R = 1,
    /// Both ends forward.
    FF = 2,
    /// Leftmost forward, rightmost reverse (innie).
    FR = 3,
    /// Leftmost reverse, rightmost forward.
    RF = 4,
    /// Both ends reverse.
    RR = 5,
}

impl Orientation {
    fn from_u8(value: u8) -> io::Result<Self> {
        Ok(match value {
            0 => Self::F,
            1 => Self::R,
            2 => Self::FF,
            3 => Self::FR,
            4 => Self::RF,
            5 => Self::RR,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid orientation code {other}"),
                ));
            }
        })
    }

    fn of_pair(end1_reverse: bool, end2_reverse: bool) -> Self {
        match (end1_reverse, end2_reverse) {
            (false, false) => Self::FF,
            (false, true) => Self::FR,
            (true, false) => Self::RF,
            (true, true) => Self::RR,
        }
    }
}

/// Serialized size of one signature.
pub const ENCODED_SIZE: usize = 56;

/// A fragment or pair read-end signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEnds {
    /// Library the source read group belongs to (0 = default).
    pub library_id: u32,
    /// Reference id of end 1.
    pub read1_ref: i32,
    /// 5'-clipped coordinate of end 1.
    pub read1_coord: i32,
    /// Strand arrangement.
    pub orientation: Orientation,
    /// Reference id of end 2 (-1 for fragments).
    pub read2_ref: i32,
    /// 5'-clipped coordinate of end 2 (-1 for fragments).
    pub read2_coord: i32,
    /// Duplicate-selection score (base-quality sum over both ends).
    pub score: u32,
    /// Read-group index (-1 when absent).
    pub read_group: i32,
    /// Flow-cell tile (0 disables optical detection).
    pub tile: u16,
    /// Cluster x pixel.
    pub x: u32,
    /// Cluster y pixel.
    pub y: u32,
    /// Input rank of end 1.
    pub read1_rank: u64,
    /// Input rank of end 2 (equals `read1_rank` for fragments).
    pub read2_rank: u64,
    /// Whether the source read belongs to a fully mapped pair.
    pub paired: bool,
}

impl ReadEnds {
    /// Builds the fragment signature of a mapped record.
    #[must_use]
    pub fn fragment(rec: &RawAlignment, libraries: &LibraryTable) -> Self {
        let (read_group, library_id) = libraries.resolve(rec.read_group());
        let (tile, x, y) = rec.physical_location().unwrap_or((0, 0, 0));
        Self {
            library_id,
            read1_ref: rec.ref_id(),
            read1_coord: rec.coordinate(),
            orientation: if rec.is_reverse() { Orientation::R } else { Orientation::F },
            read2_ref: -1,
            read2_coord: -1,
            score: rec.quality_score(),
            read_group,
            tile,
            x,
            y,
            read1_rank: rec.rank(),
            read2_rank: rec.rank(),
            paired: rec.is_paired() && !rec.is_mate_unmapped(),
        }
    }

    /// Builds the canonical pair signature of two mapped mates.
    ///
    /// End 1 is the mate with the lexicographically smaller (ref, coord);
    /// on a tie the mate carrying the read-1 flag comes first. The result
    /// is identical whichever order the mates are passed in.
    #[must_use]
    pub fn pair(a: &RawAlignment, b: &RawAlignment, libraries: &LibraryTable) -> Self {
        let key_a = (a.ref_id(), a.coordinate());
        let key_b = (b.ref_id(), b.coordinate());
        let (end1, end2) = match key_a.cmp(&key_b) {
            Ordering::Less => (a, b),
            Ordering::Greater => (b, a),
            Ordering::Equal => {
                if a.is_read1() {
                    (a, b)
                } else {
                    (b, a)
                }
            }
        };

        let (read_group, library_id) = libraries.resolve(end1.read_group());
        let (tile, x, y) = end1.physical_location().unwrap_or((0, 0, 0));
        Self {
            library_id,
            read1_ref: end1.ref_id(),
            read1_coord: end1.coordinate(),
            orientation: Orientation::of_pair(end1.is_reverse(), end2.is_reverse()),
            read2_ref: end2.ref_id(),
            read2_coord: end2.coordinate(),
            score: end1.quality_score() + end2.quality_score(),
            read_group,
            tile,
            x,
            y,
            read1_rank: end1.rank(),
            read2_rank: end2.rank(),
            paired: true,
        }
    }

    /// Pair-duplicate predicate: equality of (library, ref1, coord1,
    /// orientation, ref2, coord2).
    #[must_use]
    pub fn same_pair_signature(&self, other: &Self) -> bool {
        self.library_id == other.library_id
            && self.read1_ref == other.read1_ref
            && self.read1_coord == other.read1_coord
            && self.orientation == other.orientation
            && self.read2_ref == other.read2_ref
            && self.read2_coord == other.read2_coord
    }

    /// Fragment-duplicate predicate: equality of (library, ref1, coord1,
    /// orientation).
    #[must_use]
    pub fn same_frag_signature(&self, other: &Self) -> bool {
        self.library_id == other.library_id
            && self.read1_ref == other.read1_ref
            && self.read1_coord == other.read1_coord
            && self.orientation == other.orientation
    }

    /// Ordering for optical-duplicate scanning: read group, tile, x, y.
    #[must_use]
    pub fn cmp_optical(&self, other: &Self) -> Ordering {
        self.read_group
            .cmp(&other.read_group)
            .then(self.tile.cmp(&other.tile))
            .then(self.x.cmp(&other.x))
            .then(self.y.cmp(&other.y))
    }

    /// Serializes into the fixed-width layout.
    pub fn encode<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        let mut buf = [0u8; ENCODED_SIZE];
        buf[0..4].copy_from_slice(&self.library_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.read1_ref.to_le_bytes());
        buf[8..12].copy_from_slice(&self.read1_coord.to_le_bytes());
        buf[12] = self.orientation as u8;
        buf[13..17].copy_from_slice(&self.read2_ref.to_le_bytes());
        buf[17..21].copy_from_slice(&self.read2_coord.to_le_bytes());
        buf[21..25].copy_from_slice(&self.score.to_le_bytes());
        buf[25..29].copy_from_slice(&self.read_group.to_le_bytes());
        buf[29..31].copy_from_slice(&self.tile.to_le_bytes());
        buf[31..35].copy_from_slice(&self.x.to_le_bytes());
        buf[35..39].copy_from_slice(&self.y.to_le_bytes());
        buf[39..47].copy_from_slice(&self.read1_rank.to_le_bytes());
        buf[47..55].copy_from_slice(&self.read2_rank.to_le_bytes());
        buf[55] = u8::from(self.paired);
        out.write_all(&buf)
    }

    /// Reads one signature from the fixed-width layout.
    pub fn decode<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut buf = [0u8; ENCODED_SIZE];
        match reader.read_exact(&mut buf[..1]) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        reader.read_exact(&mut buf[1..])?;

        let le32 = |o: usize| [buf[o], buf[o + 1], buf[o + 2], buf[o + 3]];
        let le64 = |o: usize| {
            [buf[o], buf[o + 1], buf[o + 2], buf[o + 3], buf[o + 4], buf[o + 5], buf[o + 6],
                buf[o + 7]]
        };
        Ok(Some(Self {
            library_id: u32::from_le_bytes(le32(0)),
            read1_ref: i32::from_le_bytes(le32(4)),
            read1_coord: i32::from_le_bytes(le32(8)),
            orientation: Orientation::from_u8(buf[12])?,
            read2_ref: i32::from_le_bytes(le32(13)),
            read2_coord: i32::from_le_bytes(le32(17)),
            score: u32::from_le_bytes(le32(21)),
            read_group: i32::from_le_bytes(le32(25)),
            tile: u16::from_le_bytes([buf[29], buf[30]]),
            x: u32::from_le_bytes(le32(31)),
            y: u32::from_le_bytes(le32(35)),
            read1_rank: u64::from_le_bytes(le64(39)),
            read2_rank: u64::from_le_bytes(le64(47)),
            paired: buf[55] != 0,
        }))
    }
}

impl PartialOrd for ReadEnds {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadEnds {
    /// Lexicographic signature order with rank tie-breakers for stability.
    fn cmp(&self, other: &Self) -> Ordering {
        self.library_id
            .cmp(&other.library_id)
            .then(self.read1_ref.cmp(&other.read1_ref))
            .then(self.read1_coord.cmp(&other.read1_coord))
            .then(self.orientation.cmp(&other.orientation))
            .then(self.read2_ref.cmp(&other.read2_ref))
            .then(self.read2_coord.cmp(&other.read2_coord))
            .then(self.read1_rank.cmp(&other.read1_rank))
            .then(self.read2_rank.cmp(&other.read2_rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FLAG_MATE_REVERSE, FLAG_PAIRED, FLAG_READ1, FLAG_READ2, FLAG_REVERSE};
    use crate::test_support::RecordBuilder;

    fn libraries() -> LibraryTable {
        LibraryTable::from_header_text("@RG\tID:rg1\tLB:libA\n")
    }

    fn mate_pair() -> (RawAlignment, RawAlignment) {
        let fwd = RecordBuilder::new("q:1:1101:100:200")
            .ref_id(0)
            .pos(1000)
            .flags(FLAG_PAIRED | FLAG_READ1 | FLAG_MATE_REVERSE)
            .cigar(&[(50, b'M')])
            .sequence(&"A".repeat(50))
            .qualities(&[20; 50])
            .read_group("rg1")
            .rank(3)
            .build();
        let rev = RecordBuilder::new("q:1:1101:100:200")
            .ref_id(0)
            .pos(1200)
            .flags(FLAG_PAIRED | FLAG_READ2 | FLAG_REVERSE)
            .cigar(&[(50, b'M')])
            .sequence(&"A".repeat(50))
            .qualities(&[20; 50])
            .read_group("rg1")
            .rank(7)
            .build();
        (fwd, rev)
    }

    #[test]
    fn test_fragment_signature() {
        let rec = RecordBuilder::new("q:1:1101:5:6")
            .ref_id(2)
            .pos(100)
            .cigar(&[(10, b'M')])
            .sequence(&"A".repeat(10))
            .qualities(&[30; 10])
            .read_group("rg1")
            .rank(9)
            .build();
        let ends = ReadEnds::fragment(&rec, &libraries());
        assert_eq!(ends.read1_ref, 2);
        assert_eq!(ends.read1_coord, 100);
        assert_eq!(ends.orientation, Orientation::F);
        assert_eq!(ends.library_id, 1);
        assert_eq!(ends.score, 300);
        assert_eq!(ends.read1_rank, 9);
        assert_eq!(ends.read2_rank, 9);
        assert!(!ends.paired);
    }

    #[test]
    fn test_pair_canonicalization_is_order_independent() {
        let (a, b) = mate_pair();
        let libs = libraries();
        let ab = ReadEnds::pair(&a, &b, &libs);
        let ba = ReadEnds::pair(&b, &a, &libs);
        assert_eq!(ab, ba);
        assert_eq!(ab.orientation, Orientation::FR);
        assert_eq!(ab.read1_coord, 1000);
        assert_eq!(ab.read2_coord, 1249);
        assert_eq!(ab.read1_rank, 3);
        assert_eq!(ab.read2_rank, 7);
        assert_eq!(ab.score, 2000);
    }

    #[test]
    fn test_pair_tie_broken_by_read1_flag() {
        let libs = libraries();
        let r1 = RecordBuilder::new("t")
            .pos(100)
            .flags(FLAG_PAIRED | FLAG_READ1)
            .cigar(&[(10, b'M')])
            .rank(0)
            .build();
        let r2 = RecordBuilder::new("t")
            .pos(100)
            .flags(FLAG_PAIRED | FLAG_READ2)
            .cigar(&[(10, b'M')])
            .rank(1)
            .build();
        let ends = ReadEnds::pair(&r2, &r1, &libs);
        assert_eq!(ends.read1_rank, 0);
        assert_eq!(ends.read2_rank, 1);
    }

    #[test]
    fn test_signature_predicates() {
        let (a, b) = mate_pair();
        let libs = libraries();
        let pair = ReadEnds::pair(&a, &b, &libs);
        let frag = ReadEnds::fragment(&a, &libs);
        assert!(pair.same_pair_signature(&pair.clone()));
        assert!(frag.same_frag_signature(&pair));
        assert!(!frag.same_pair_signature(&pair));
    }

    #[test]
    fn test_codec_roundtrip() {
        let (a, b) = mate_pair();
        let libs = libraries();
        for ends in [ReadEnds::pair(&a, &b, &libs), ReadEnds::fragment(&a, &libs)] {
            let mut buf = Vec::new();
            ends.encode(&mut buf).unwrap();
            let decoded = ReadEnds::decode(&mut buf.as_slice()).unwrap().unwrap();
            assert_eq!(decoded, ends);
        }
    }

    #[test]
    fn test_decode_empty_stream() {
        assert!(ReadEnds::decode(&mut [].as_slice()).unwrap().is_none());
    }

    #[test]
    fn test_ordering_by_signature_then_rank() {
        let libs = libraries();
        let (a, b) = mate_pair();
        let mut e1 = ReadEnds::pair(&a, &b, &libs);
        let mut e2 = e1.clone();
        e1.read1_rank = 5;
        e2.read1_rank = 2;
        assert!(e2 < e1);
        e2.read1_coord += 1;
        assert!(e1 < e2);
    }
}

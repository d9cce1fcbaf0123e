//! The duplicate-marking rules.
//!
//! Two passes over sorted signature streams. The pair pass groups by the
//! full pair signature, keeps the best-scoring pair of each group, marks
//! the rest, and scans each group for optical duplicates. The fragment
//! pass groups by the fragment signature; unpaired reads lose to any pair
//! covering the same 5' end, and all-unpaired groups keep their best
//! scorer.

use std::io;

use crate::bitmap::DupRankSink;
use crate::ends_container::SortedEndsDecoder;
use crate::metrics::MetricsMap;
use crate::read_ends::ReadEnds;

/// Default pixel window for optical-duplicate detection.
pub const DEFAULT_OPTICAL_PIXEL_DISTANCE: u32 = 100;

fn mark(ends: &ReadEnds, sink: &mut dyn DupRankSink, metrics: &mut MetricsMap) -> io::Result<()> {
    sink.set(ends.read1_rank)?;
    if ends.paired {
        sink.set(ends.read2_rank)?;
        metrics.library_mut(ends.library_id).readpairduplicates += 1;
    } else {
        metrics.library_mut(ends.library_id).unpairedreadduplicates += 1;
    }
    Ok(())
}

/// Index of the keeper: highest score, earliest entry on ties.
fn keeper_index(group: &[ReadEnds]) -> usize {
    let mut best = 0;
    for (i, ends) in group.iter().enumerate().skip(1) {
        if ends.score > group[best].score {
            best = i;
        }
    }
    best
}

/// Marks duplicates within one pair equivalence class and counts optical
/// duplicates. Returns the number of reads marked.
pub fn mark_duplicate_pairs(
    group: &mut [ReadEnds],
    sink: &mut dyn DupRankSink,
    metrics: &mut MetricsMap,
    optical_pixel_distance: u32,
) -> io::Result<u64> {
    if group.len() < 2 {
        return Ok(0);
    }

    let keeper = keeper_index(group);
    for (i, ends) in group.iter().enumerate() {
        if i != keeper {
            mark(ends, sink, metrics)?;
        }
    }

    count_optical_duplicates(group, metrics, optical_pixel_distance);

    Ok(2 * (group.len() as u64 - 1))
}

/// Scans a pair group for clusters close enough on the flow cell to be
/// optical rather than PCR duplicates.
fn count_optical_duplicates(
    group: &mut [ReadEnds],
    metrics: &mut MetricsMap,
    optical_pixel_distance: u32,
) {
    group.sort_by(ReadEnds::cmp_optical);

    let mut low = 0;
    while low < group.len() {
        // One (read group, tile) run at a time.
        let mut high = low + 1;
        while high < group.len()
            && group[high].read_group == group[low].read_group
            && group[high].tile == group[low].tile
        {
            high += 1;
        }

        if high - low > 1 && group[low].tile != 0 {
            let run = &group[low..high];
            let mut optical = vec![false; run.len()];
            for i in 0..run.len() - 1 {
                for j in i + 1..run.len() {
                    if run[j].x - run[i].x > optical_pixel_distance {
                        break;
                    }
                    let dy = i64::from(run[i].y).abs_diff(i64::from(run[j].y));
                    if dy <= u64::from(optical_pixel_distance) {
                        optical[j] = true;
                    }
                }
            }
            #[allow(clippy::cast_possible_truncation)]
            let count = optical.iter().filter(|&&o| o).count() as u64;
            if count > 0 {
                metrics.library_mut(run[0].library_id).opticalduplicates += count;
            }
        }

        low = high;
    }
}

/// Marks duplicates within one fragment equivalence class. Returns the
/// number of reads marked.
pub fn mark_duplicate_frags(
    group: &[ReadEnds],
    sink: &mut dyn DupRankSink,
    metrics: &mut MetricsMap,
) -> io::Result<u64> {
    if group.len() < 2 {
        return Ok(0);
    }

    let contains_pairs = group.iter().any(|e| e.paired);
    let contains_frags = group.iter().any(|e| !e.paired);
    if !contains_frags {
        // Every member belongs to a pair; the pair pass owns them.
        return Ok(0);
    }

    if contains_pairs {
        let mut marked = 0;
        for ends in group.iter().filter(|e| !e.paired) {
            mark(ends, sink, metrics)?;
            marked += 1;
        }
        Ok(marked)
    } else {
        let keeper = keeper_index(group);
        for (i, ends) in group.iter().enumerate() {
            if i != keeper {
                mark(ends, sink, metrics)?;
            }
        }
        Ok(group.len() as u64 - 1)
    }
}

/// Runs the pair pass over a sorted pair stream.
pub fn process_pair_stream(
    decoder: &mut SortedEndsDecoder,
    sink: &mut dyn DupRankSink,
    metrics: &mut MetricsMap,
    optical_pixel_distance: u32,
) -> io::Result<u64> {
    let mut group: Vec<ReadEnds> = Vec::new();
    let mut marked = 0;
    while let Some(next) = decoder.next()? {
        if group.first().is_some_and(|first| !next.same_pair_signature(first)) {
            marked += mark_duplicate_pairs(&mut group, sink, metrics, optical_pixel_distance)?;
            group.clear();
        }
        group.push(next);
    }
    marked += mark_duplicate_pairs(&mut group, sink, metrics, optical_pixel_distance)?;
    Ok(marked)
}

/// Runs the fragment pass over a sorted fragment stream.
pub fn process_frag_stream(
    decoder: &mut SortedEndsDecoder,
    sink: &mut dyn DupRankSink,
    metrics: &mut MetricsMap,
) -> io::Result<u64> {
    let mut group: Vec<ReadEnds> = Vec::new();
    let mut marked = 0;
    while let Some(next) = decoder.next()? {
        if group.first().is_some_and(|first| !next.same_frag_signature(first)) {
            marked += mark_duplicate_frags(&group, sink, metrics)?;
            group.clear();
        }
        group.push(next);
    }
    marked += mark_duplicate_frags(&group, sink, metrics)?;
    Ok(marked)
}

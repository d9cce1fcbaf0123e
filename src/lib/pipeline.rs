//! The duplicate-detection pass: collation through rule engine.
//!
//! [`collect_duplicates`] consumes a BAM record stream once and returns
//! the duplicate bitmap plus per-library metrics. Applying the bitmap to
//! the output stream is the separate second pass in
//! [`crate::applicator`].

use std::io::{self, Read};

use log::info;

use crate::bam_input::BamReader;
use crate::bitmap::DupBitmap;
use crate::collator::{Collated, Collator, CollatorConfig, InputObserver};
use crate::dup_engine::{
    DEFAULT_OPTICAL_PIXEL_DISTANCE, process_frag_stream, process_pair_stream,
};
use crate::ends_container::ReadEndsContainer;
use crate::header::LibraryTable;
use crate::logging::OperationTimer;
use crate::metrics::MetricsMap;
use crate::position_tracker::PositionTracker;
use crate::progress::ProgressReporter;
use crate::read_ends::ReadEnds;
use crate::record::RawAlignment;
use crate::tempfiles::{SUFFIX_COLLATE, SUFFIX_FRAGS, SUFFIX_PAIRS, TempFileRegistry};

/// Tuning for the detection pass.
pub struct PipelineConfig {
    /// log2 of the collation hash table size.
    pub col_hash_bits: u32,
    /// Collation spill buffer budget in bytes.
    pub col_list_size: usize,
    /// Read-end sort buffer size in bytes.
    pub frag_buf_size: usize,
    /// Pixel window for optical-duplicate detection.
    pub optical_pixel_distance: u32,
    /// Sort spill runs on the rayon pool.
    pub parallel_sort: bool,
    /// Emit progress lines.
    pub verbose: bool,
    /// Records between progress lines.
    pub progress_window: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            col_hash_bits: 20,
            col_list_size: 32 * 1024 * 1024,
            frag_buf_size: 48 * 1024 * 1024,
            optical_pixel_distance: DEFAULT_OPTICAL_PIXEL_DISTANCE,
            parallel_sort: false,
            verbose: false,
            progress_window: 1_048_576,
        }
    }
}

/// Everything the detection pass produces.
pub struct PipelineOutput {
    /// Duplicate bitmap indexed by input rank.
    pub bitmap: DupBitmap,
    /// Per-library counters (duplicate fields filled in).
    pub metrics: MetricsMap,
    /// Total records read.
    pub records: u64,
    /// Pairs emitted from finished tracker buckets.
    pub fincnt: u64,
    /// Pairs expunged past the tracker window.
    pub excnt: u64,
    /// Non-simple pairs routed straight to the container.
    pub strcnt: u64,
}

/// Runs collation, position tracking, external sorting, and the rule
/// engine over `reader`, assigning ranks in input order.
///
/// `extra_observer` (the intermediate-store capture, when the input is a
/// pipe) runs after the position tracker for every record.
pub fn collect_duplicates<R: Read>(
    reader: &mut BamReader<R>,
    libraries: &LibraryTable,
    mut extra_observer: Option<&mut dyn InputObserver>,
    registry: &mut TempFileRegistry,
    config: &PipelineConfig,
) -> io::Result<PipelineOutput> {
    let collator_config = CollatorConfig {
        hash_bits: config.col_hash_bits,
        spill_buffer_bytes: config.col_list_size,
    };
    let mut collator = Collator::new(registry.path(SUFFIX_COLLATE), &collator_config);
    let mut tracker = PositionTracker::new();
    let mut frags = ReadEndsContainer::new(
        registry.path(SUFFIX_FRAGS),
        config.frag_buf_size,
        config.parallel_sort,
    );
    let mut pairs = ReadEndsContainer::new(
        registry.path(SUFFIX_PAIRS),
        config.frag_buf_size,
        config.parallel_sort,
    );
    let mut metrics = MetricsMap::default();

    let mut progress = ProgressReporter::new("Collated", config.progress_window, config.verbose);
    let mut rank: u64 = 0;
    loop {
        let Some(bytes) = reader.next_record()? else { break };
        let rec = RawAlignment::new(bytes, rank)?;
        rank += 1;
        progress.tick();

        let collated = {
            let mut observers: Vec<&mut dyn InputObserver> = vec![&mut tracker];
            if let Some(observer) = extra_observer.as_deref_mut() {
                observers.push(observer);
            }
            collator.put(rec, &mut observers)?
        };
        if let Some(collated) = collated {
            process_collated(collated, &mut tracker, &mut frags, &mut pairs, libraries, &mut metrics)?;
        }
    }
    progress.finish();

    let collator_spilled = collator.spilled();
    let mut drain = collator.finish()?;
    while let Some(collated) = drain.next()? {
        process_collated(collated, &mut tracker, &mut frags, &mut pairs, libraries, &mut metrics)?;
    }
    tracker.flush(&mut pairs, libraries)?;
    info!(
        "Pair routing: {} finished, {} expunged, {} straddled, {} collator spills",
        tracker.fincnt,
        tracker.excnt,
        tracker.strcnt,
        collator_spilled
    );

    frags.flush()?;
    pairs.flush()?;
    info!("Read {rank} alignments: {} fragment ends, {} pair ends", frags.len(), pairs.len());

    let mut bitmap = DupBitmap::new(rank);

    let timer = OperationTimer::new("Checking pairs");
    let mut pair_decoder = pairs.into_decoder()?;
    let marked = process_pair_stream(
        &mut pair_decoder,
        &mut bitmap,
        &mut metrics,
        config.optical_pixel_distance,
    )?;
    timer.log_completion(marked);

    let timer = OperationTimer::new("Checking fragments");
    let mut frag_decoder = frags.into_decoder()?;
    let marked = process_frag_stream(&mut frag_decoder, &mut bitmap, &mut metrics)?;
    timer.log_completion(marked);

    info!("Alignments marked as duplicates: {}", bitmap.count_ones());

    Ok(PipelineOutput {
        bitmap,
        metrics,
        records: rank,
        fincnt: tracker.fincnt,
        excnt: tracker.excnt,
        strcnt: tracker.strcnt,
    })
}

/// Classifies one record into its library's counters.
fn classify(rec: &RawAlignment, libraries: &LibraryTable, metrics: &mut MetricsMap) {
    let (_, library_id) = libraries.resolve(rec.read_group());
    let m = metrics.library_mut(library_id);
    if rec.is_unmapped() {
        m.unmapped += 1;
    } else if !rec.is_paired() || rec.is_mate_unmapped() {
        m.unpaired += 1;
    }
}

/// Routes one collated output into metrics and the read-end containers.
fn process_collated(
    collated: Collated,
    tracker: &mut PositionTracker,
    frags: &mut ReadEndsContainer,
    pairs: &mut ReadEndsContainer,
    libraries: &LibraryTable,
    metrics: &mut MetricsMap,
) -> io::Result<()> {
    match collated {
        Collated::Single(rec) => {
            // Secondary and supplementary records keep their rank slot but
            // never produce read-ends or counters.
            if rec.is_secondary_or_supplementary() {
                return Ok(());
            }
            classify(&rec, libraries, metrics);
            if !rec.is_unmapped() {
                frags.put(ReadEnds::fragment(&rec, libraries))?;
            }
        }
        Collated::Pair(a, b) => {
            classify(&a, libraries, metrics);
            classify(&b, libraries, metrics);

            match (!a.is_unmapped(), !b.is_unmapped()) {
                (true, true) => {
                    let (_, library_id) = libraries.resolve(a.read_group());
                    metrics.library_mut(library_id).readpairsexamined += 1;

                    // Leftmost mate first; ties go to read 1.
                    let a_key = (a.ref_id(), a.pos());
                    let b_key = (b.ref_id(), b.pos());
                    let (left, right) = if a_key < b_key || (a_key == b_key && a.is_read1()) {
                        (a, b)
                    } else {
                        (b, a)
                    };

                    frags.put(ReadEnds::fragment(&left, libraries))?;
                    frags.put(ReadEnds::fragment(&right, libraries))?;

                    if PositionTracker::is_simple_pair(&right) {
                        tracker.add_pair(left, right, pairs, libraries)?;
                        tracker.check_finished(pairs, libraries)?;
                    } else {
                        pairs.put(ReadEnds::pair(&left, &right, libraries))?;
                        tracker.strcnt += 1;
                    }
                }
                (true, false) => frags.put(ReadEnds::fragment(&a, libraries))?,
                (false, true) => frags.put(ReadEnds::fragment(&b, libraries))?,
                (false, false) => {}
            }
        }
    }
    Ok(())
}

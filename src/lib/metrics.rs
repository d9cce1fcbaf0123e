//! Per-library duplication metrics and the rendered report.
//!
//! Counter semantics follow the classic duplication-metrics table:
//! unpaired/unmapped/pairs-examined counted as records are collated,
//! duplicate counters filled in by the rule engine, and derived fields
//! (duplication fraction, estimated library size) computed at render time.

use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::header::LibraryTable;

/// Counters for one library.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DuplicationMetrics {
    /// Unmapped records.
    pub unmapped: u64,
    /// Mapped records without a usable mate (unpaired, or mate unmapped).
    pub unpaired: u64,
    /// Fully mapped pairs examined.
    pub readpairsexamined: u64,
    /// Unpaired records marked duplicate.
    pub unpairedreadduplicates: u64,
    /// Pairs marked duplicate.
    pub readpairduplicates: u64,
    /// Pairs judged optical duplicates.
    pub opticalduplicates: u64,
}

impl DuplicationMetrics {
    /// Fraction of examined reads that are duplicates.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_duplication(&self) -> f64 {
        let examined = self.unpaired + 2 * self.readpairsexamined;
        if examined == 0 {
            0.0
        } else {
            (self.unpairedreadduplicates + 2 * self.readpairduplicates) as f64 / examined as f64
        }
    }

    /// Lander-Waterman estimate of the library's unique molecule count.
    ///
    /// `None` when the library saw no duplicate pairs (the inversion has no
    /// solution without them).
    #[must_use]
    pub fn estimated_library_size(&self) -> Option<u64> {
        let pairs = self.readpairsexamined.saturating_sub(self.opticalduplicates);
        let unique_pairs = self.readpairsexamined.saturating_sub(self.readpairduplicates);
        estimate_library_size(pairs, unique_pairs)
    }

    /// Expected ROI histogram: bin → expected coverage multiple when
    /// sequencing `bin` times the observed depth.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn roi_histogram(&self) -> Vec<(u32, f64)> {
        let Some(library_size) = self.estimated_library_size() else {
            return Vec::new();
        };
        let pairs = (self.readpairsexamined - self.opticalduplicates) as f64;
        let unique_pairs = (self.readpairsexamined - self.readpairduplicates) as f64;
        let library_size = library_size as f64;

        (1..=100)
            .map(|bin| {
                let x = f64::from(bin);
                let roi = library_size * (1.0 - (-(x * pairs) / library_size).exp()) / unique_pairs;
                (bin, roi)
            })
            .collect()
    }
}

/// Inverts the Lander-Waterman equation C/X = 1 - exp(-N/X) by bisection.
///
/// `pairs` is N (read pairs sequenced, optical duplicates excluded),
/// `unique_pairs` is C (distinct molecules observed).
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn estimate_library_size(pairs: u64, unique_pairs: u64) -> Option<u64> {
    let duplicate_pairs = pairs.saturating_sub(unique_pairs);
    if pairs == 0 || duplicate_pairs == 0 || unique_pairs == 0 {
        return None;
    }

    let n = pairs as f64;
    let c = unique_pairs as f64;
    let f = |x: f64| c / x - 1.0 + (-n / x).exp();

    if c >= n || f(c) < 0.0 {
        return None;
    }

    let mut lo = 1.0;
    let mut hi = 100.0;
    while f(hi * c) > 0.0 {
        hi *= 10.0;
    }
    for _ in 0..40 {
        let mid = (lo + hi) / 2.0;
        let v = f(mid * c);
        if v > 0.0 {
            lo = mid;
        } else if v < 0.0 {
            hi = mid;
        } else {
            break;
        }
    }

    Some((c * (lo + hi) / 2.0) as u64)
}

/// All libraries' counters, keyed by library id.
#[derive(Default)]
pub struct MetricsMap {
    map: BTreeMap<u32, DuplicationMetrics>,
}

impl MetricsMap {
    /// The counters for `library_id`, created on first touch.
    pub fn library_mut(&mut self, library_id: u32) -> &mut DuplicationMetrics {
        self.map.entry(library_id).or_default()
    }

    /// Iterates (library id, counters) in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &DuplicationMetrics)> {
        self.map.iter().map(|(&id, m)| (id, m))
    }

    /// Number of libraries touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no library was touched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sum of duplicate reads across libraries: unpaired duplicates plus
    /// two per duplicate pair.
    #[must_use]
    pub fn total_duplicate_reads(&self) -> u64 {
        self.map
            .values()
            .map(|m| m.unpairedreadduplicates + 2 * m.readpairduplicates)
            .sum()
    }

    /// Renders the metrics report.
    ///
    /// A command-line comment and a `##METRICS` table with one row per
    /// library; when exactly one library is present, a `## HISTOGRAM`
    /// section follows.
    pub fn write_report<W: Write + ?Sized>(
        &self,
        out: &mut W,
        libraries: &LibraryTable,
        command_line: &str,
    ) -> io::Result<()> {
        writeln!(out, "# {command_line}")?;
        writeln!(out, "##METRICS")?;
        writeln!(
            out,
            "LIBRARY\tUNPAIRED_READS_EXAMINED\tREAD_PAIRS_EXAMINED\tUNMAPPED_READS\t\
             UNPAIRED_READ_DUPLICATES\tREAD_PAIR_DUPLICATES\tREAD_PAIR_OPTICAL_DUPLICATES\t\
             PERCENT_DUPLICATION\tESTIMATED_LIBRARY_SIZE"
        )?;

        for (library_id, m) in self.iter() {
            let size = m.estimated_library_size().map_or(String::new(), |s| s.to_string());
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.6}\t{}",
                libraries.library_name(library_id),
                m.unpaired,
                m.readpairsexamined,
                m.unmapped,
                m.unpairedreadduplicates,
                m.readpairduplicates,
                m.opticalduplicates,
                m.percent_duplication(),
                size,
            )?;
        }

        if self.map.len() == 1 {
            let m = self.map.values().next().expect("one entry");
            let histogram = m.roi_histogram();
            if !histogram.is_empty() {
                writeln!(out)?;
                writeln!(out, "## HISTOGRAM")?;
                writeln!(out, "BIN\tVALUE")?;
                for (bin, value) in histogram {
                    writeln!(out, "{bin}\t{value}")?;
                }
            }
        }

        out.flush()
    }
}

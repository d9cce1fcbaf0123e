//! End-to-end pipeline tests over synthesized BAM streams.
//!
//! Each test builds a small BAM in memory, runs the detection pass, and
//! applies the resulting bitmap with the fast-patch or rewrite applicator,
//! asserting on the output flags and the metrics table.

use std::io::Cursor;

use tempfile::TempDir;

use bammarkdup_lib::applicator::{patch_stream, patch_stream_parallel, rewrite_stream};
use bammarkdup_lib::bam_input::BamReader;
use bammarkdup_lib::header::{LibraryTable, add_program_line};
use bammarkdup_lib::pipeline::{PipelineConfig, PipelineOutput, collect_duplicates};
use bammarkdup_lib::progress::ProgressReporter;
use bammarkdup_lib::record::{
    FLAG_DUPLICATE, FLAG_MATE_REVERSE, FLAG_PAIRED, FLAG_READ1, FLAG_READ2, FLAG_REVERSE,
    RawAlignment,
};
use bammarkdup_lib::tempfiles::TempFileRegistry;
use bammarkdup_lib::test_support::{RecordBuilder, build_bam};

const HEADER: &str = "@HD\tVN:1.6\n@SQ\tSN:chr1\tLN:100000\n@RG\tID:rg1\tLB:libA\n";
const REFS: &[(&str, u32)] = &[("chr1", 100_000)];

/// An innie pair; both mates carry the given name (tile/x/y derive from it)
/// and flat quality.
fn pair(name: &str, fwd_pos: i32, rev_pos: i32, qual: u8, rank: u64) -> [RawAlignment; 2] {
    let fwd = RecordBuilder::new(name)
        .pos(fwd_pos)
        .mate_ref_id(0)
        .mate_pos(rev_pos)
        .flags(FLAG_PAIRED | FLAG_READ1 | FLAG_MATE_REVERSE)
        .cigar(&[(10, b'M')])
        .sequence(&"A".repeat(10))
        .qualities(&[qual; 10])
        .read_group("rg1")
        .rank(rank)
        .build();
    let rev = RecordBuilder::new(name)
        .pos(rev_pos)
        .mate_ref_id(0)
        .mate_pos(fwd_pos)
        .flags(FLAG_PAIRED | FLAG_READ2 | FLAG_REVERSE)
        .cigar(&[(10, b'M')])
        .sequence(&"A".repeat(10))
        .qualities(&[qual; 10])
        .read_group("rg1")
        .rank(rank + 1)
        .build();
    [fwd, rev]
}

fn detect(bam: &[u8], config: &PipelineConfig) -> PipelineOutput {
    let dir = TempDir::new().unwrap();
    let mut registry = TempFileRegistry::new(dir.path().join("run"));
    let mut reader = BamReader::new(Cursor::new(bam.to_vec())).unwrap();
    let libraries = LibraryTable::from_header_text(&reader.header().text.clone());
    collect_duplicates(&mut reader, &libraries, None, &mut registry, config).unwrap()
}

fn read_records(bam: &[u8]) -> Vec<RawAlignment> {
    let mut reader = BamReader::new(Cursor::new(bam.to_vec())).unwrap();
    let mut records = Vec::new();
    let mut rank = 0;
    while let Some(bytes) = reader.next_record().unwrap() {
        records.push(RawAlignment::new(bytes, rank).unwrap());
        rank += 1;
    }
    records
}

fn mark(bam: &[u8], output_dups: &PipelineOutput, command_line: &str) -> Vec<u8> {
    let reader = BamReader::new(Cursor::new(bam.to_vec())).unwrap();
    let text = reader.header().text.clone();
    let new_text = add_program_line(&text, "bammarkduplicates", "0.1.0", command_line);
    let mut out = Vec::new();
    let mut progress = ProgressReporter::new("Marked", 1024, false);
    patch_stream(
        Cursor::new(bam.to_vec()),
        &mut out,
        &output_dups.bitmap,
        &new_text,
        6,
        &mut progress,
    )
    .unwrap();
    out
}

#[test]
fn marks_lower_quality_pair_of_two() {
    let [a1, a2] = pair("hq:1:1101:500:500", 1000, 1400, 30, 0);
    let [b1, b2] = pair("lq:1:1101:9000:9000", 1000, 1400, 20, 2);
    let bam = build_bam(HEADER, REFS, &[a1, a2, b1, b2]);

    let result = detect(&bam, &PipelineConfig::default());
    assert_eq!(result.records, 4);
    assert_eq!(result.bitmap.count_ones(), 2);

    let marked = mark(&bam, &result, "bammarkduplicates --input test.bam");
    let records = read_records(&marked);
    assert_eq!(records.len(), 4);

    let dup_flags: Vec<bool> =
        records.iter().map(|r| r.flags() & FLAG_DUPLICATE != 0).collect();
    assert_eq!(dup_flags, vec![false, false, true, true]);

    // Every byte except the patched flag byte survives the recode.
    let originals = read_records(&bam);
    for (orig, new) in originals.iter().zip(&records) {
        if new.flags() & FLAG_DUPLICATE == 0 {
            assert_eq!(orig.as_bytes(), new.as_bytes());
        }
    }
}

#[test]
fn output_header_gains_one_pg_line() {
    let [a1, a2] = pair("q:1:1101:1:1", 1000, 1400, 30, 0);
    let bam = build_bam(HEADER, REFS, &[a1, a2]);
    let result = detect(&bam, &PipelineConfig::default());
    let marked = mark(&bam, &result, "bammarkduplicates");

    let reader = BamReader::new(Cursor::new(marked)).unwrap();
    let text = &reader.header().text;
    assert!(text.contains("@PG\tID:bammarkduplicates\tPN:bammarkduplicates"));
    assert!(text.contains("VN:0.1.0"));
    // All original header lines survive.
    for line in HEADER.lines() {
        assert!(text.contains(line), "missing header line {line}");
    }
}

#[test]
fn rerunning_on_marked_output_is_stable() {
    let [a1, a2] = pair("hq:1:1101:500:500", 1000, 1400, 30, 0);
    let [b1, b2] = pair("lq:1:1101:9000:9000", 1000, 1400, 20, 2);
    let bam = build_bam(HEADER, REFS, &[a1, a2, b1, b2]);

    let first = detect(&bam, &PipelineConfig::default());
    let marked_once = mark(&bam, &first, "run1");

    // The second run must find the same duplicate set (input duplicate
    // flags are ignored and recomputed) and leave record bytes unchanged.
    let second = detect(&marked_once, &PipelineConfig::default());
    assert_eq!(second.bitmap.count_ones(), first.bitmap.count_ones());
    for rank in 0..first.records {
        assert_eq!(first.bitmap.get(rank), second.bitmap.get(rank), "rank {rank}");
    }

    let marked_twice = mark(&marked_once, &second, "run2");
    let once_records = read_records(&marked_once);
    let twice_records = read_records(&marked_twice);
    assert_eq!(once_records.len(), twice_records.len());
    for (a, b) in once_records.iter().zip(&twice_records) {
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}

#[test]
fn optical_duplicates_counted_within_pixel_window() {
    // Same read group, same tile; clusters 50 x-pixels and 10 y-pixels
    // apart fall inside the default window.
    let [a1, a2] = pair("m:1:1101:100:200", 1000, 1400, 30, 0);
    let [b1, b2] = pair("m:1:1101:150:210", 1000, 1400, 20, 2);
    let bam = build_bam(HEADER, REFS, &[a1, a2, b1, b2]);

    let result = detect(&bam, &PipelineConfig::default());
    let mut metrics = result.metrics;
    assert_eq!(metrics.library_mut(1).readpairduplicates, 1);
    assert_eq!(metrics.library_mut(1).opticalduplicates, 1);
}

#[test]
fn distant_clusters_are_not_optical() {
    let [a1, a2] = pair("m:1:1101:100:200", 1000, 1400, 30, 0);
    let [b1, b2] = pair("m:1:1101:5000:9000", 1000, 1400, 20, 2);
    let bam = build_bam(HEADER, REFS, &[a1, a2, b1, b2]);

    let result = detect(&bam, &PipelineConfig::default());
    let mut metrics = result.metrics;
    assert_eq!(metrics.library_mut(1).readpairduplicates, 1);
    assert_eq!(metrics.library_mut(1).opticalduplicates, 0);
}

#[test]
fn collation_handles_interleaved_and_distant_mates() {
    // Mates of different templates interleave; one template's mates sit at
    // opposite ends of the stream. A tiny hash table forces spilling.
    let [a1, a2] = pair("t1:1:1101:1:1", 1000, 1400, 30, 0);
    let [b1, b2] = pair("t2:1:1101:2:2", 2000, 2400, 30, 0);
    let [c1, c2] = pair("t3:1:1101:3:3", 3000, 3400, 30, 0);
    let mut records = vec![a1, b1, c1, a2, b2, c2];
    for (rank, rec) in records.iter_mut().enumerate() {
        // Re-rank to the actual stream order.
        *rec = RawAlignment::new(rec.as_bytes().to_vec(), rank as u64).unwrap();
    }
    let bam = build_bam(HEADER, REFS, &records);

    let config = PipelineConfig { col_hash_bits: 1, col_list_size: 64, ..Default::default() };
    let result = detect(&bam, &config);
    let mut metrics = result.metrics;
    assert_eq!(metrics.library_mut(1).readpairsexamined, 3);
    assert_eq!(result.bitmap.count_ones(), 0);
}

#[test]
fn parallel_patch_equals_serial_patch() {
    let mut records = Vec::new();
    let mut rank = 0;
    for i in 0..200 {
        let [r1, r2] = pair(
            &format!("t{i}:1:1101:{}:{}", 100 + i, 200 + i),
            1000 + (i % 7) * 100,
            2000 + (i % 7) * 100,
            20 + (i % 20) as u8,
            rank,
        );
        records.push(r1);
        records.push(r2);
        rank += 2;
    }
    let bam = build_bam(HEADER, REFS, &records);
    let result = detect(&bam, &PipelineConfig::default());

    let text = {
        let reader = BamReader::new(Cursor::new(bam.clone())).unwrap();
        add_program_line(&reader.header().text, "bammarkduplicates", "0.1.0", "cmd")
    };

    let mut serial = Vec::new();
    let mut progress = ProgressReporter::new("Marked", 1024, false);
    patch_stream(Cursor::new(bam.clone()), &mut serial, &result.bitmap, &text, 6, &mut progress)
        .unwrap();

    let mut parallel = Vec::new();
    let mut progress = ProgressReporter::new("Marked", 1024, false);
    patch_stream_parallel(
        Cursor::new(bam),
        &mut parallel,
        &result.bitmap,
        &text,
        6,
        4,
        &mut progress,
    )
    .unwrap();

    let a = read_records(&serial);
    let b = read_records(&parallel);
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.as_bytes(), y.as_bytes());
    }
}

#[test]
fn remove_duplicates_drops_marked_records() {
    let [a1, a2] = pair("hq:1:1101:500:500", 1000, 1400, 30, 0);
    let [b1, b2] = pair("lq:1:1101:9000:9000", 1000, 1400, 20, 2);
    let bam = build_bam(HEADER, REFS, &[a1, a2, b1, b2]);
    let result = detect(&bam, &PipelineConfig::default());

    let mut source = BamReader::new(Cursor::new(bam.clone())).unwrap();
    let mut out = Vec::new();
    let mut progress = ProgressReporter::new("Rewritten", 1024, false);
    let seen = rewrite_stream(
        &mut source,
        &mut out,
        &result.bitmap,
        HEADER,
        &[("chr1".to_string(), 100_000)],
        6,
        true,
        &mut progress,
    )
    .unwrap();
    assert_eq!(seen, 4);

    let survivors = read_records(&out);
    assert_eq!(survivors.len(), 2);
    for rec in &survivors {
        assert!(rec.name().starts_with(b"hq"));
        assert_eq!(rec.flags() & FLAG_DUPLICATE, 0);
    }
}

#[test]
fn metrics_report_renders_for_single_library() {
    let [a1, a2] = pair("hq:1:1101:500:500", 1000, 1400, 30, 0);
    let [b1, b2] = pair("lq:1:1101:9000:9000", 1000, 1400, 20, 2);
    let bam = build_bam(HEADER, REFS, &[a1, a2, b1, b2]);
    let result = detect(&bam, &PipelineConfig::default());

    let libraries = LibraryTable::from_header_text(HEADER);
    let mut report = Vec::new();
    result.metrics.write_report(&mut report, &libraries, "bammarkduplicates -i t.bam").unwrap();
    let text = String::from_utf8(report).unwrap();

    assert!(text.contains("##METRICS"));
    let row = text.lines().find(|l| l.starts_with("libA\t")).expect("libA row");
    let fields: Vec<&str> = row.split('\t').collect();
    // unpaired, pairs examined, unmapped, unpaired dups, pair dups
    assert_eq!(&fields[1..6], &["0", "2", "0", "0", "1"]);
    // Exactly one library: the saturation histogram is present.
    assert!(text.contains("## HISTOGRAM"));
}

#[test]
fn free_list_pressure_still_yields_correct_bitmap() {
    // Thousands of pairs whose reverse mates all stream by before any
    // forward mate, so every bucket stays active simultaneously and the
    // cell arena runs dry. Every 50th pair shares one signature; those
    // duplicates must be found whether their bucket finished, was
    // expunged, or was bypassed after expunge.
    let n: i32 = 5000;
    let mut forwards = Vec::new();
    let mut reverses = Vec::new();
    let mut rank = 0u64;
    for i in 0..n {
        let (fwd_pos, rev_pos) =
            if i % 50 == 0 { (1000, 50_000) } else { (1000 + i, 60_000 + i) };
        let [fwd, rev] = pair(&format!("t{i}:1:1101:{i}:0"), fwd_pos, rev_pos, 30, 0);
        forwards.push(fwd);
        reverses.push(rev);
    }
    let mut records = Vec::new();
    for rev in reverses {
        records.push(RawAlignment::new(rev.as_bytes().to_vec(), rank).unwrap());
        rank += 1;
    }
    for fwd in forwards {
        records.push(RawAlignment::new(fwd.as_bytes().to_vec(), rank).unwrap());
        rank += 1;
    }
    let bam = build_bam(HEADER, REFS, &records);

    let result = detect(&bam, &PipelineConfig::default());
    assert!(result.excnt > 0, "expected bucket expunges under arena pressure");

    // 100 pairs share the (1000, 50000) signature: 99 duplicate pairs.
    assert_eq!(result.bitmap.count_ones(), 198);
    let mut metrics = result.metrics;
    assert_eq!(metrics.library_mut(1).readpairsexamined, n as u64);
    assert_eq!(metrics.library_mut(1).readpairduplicates, 99);
}

//! The duplicate-marking command.
//!
//! Wires CLI options into the library pipeline: the detection pass
//! ([`bammarkdup_lib::pipeline`]), the metrics report, and the second pass
//! that applies the duplicate bitmap onto the output BAM
//! ([`bammarkdup_lib::applicator`]).

use std::fs::File;
use std::io::{self, BufReader, BufWriter, IsTerminal, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;

use bammarkdup_lib::MarkDupError;
use bammarkdup_lib::alignment_store::{BamStoreWriter, ZstdStoreReader, ZstdStoreWriter};
use bammarkdup_lib::applicator::{patch_stream, patch_stream_parallel, rewrite_stream};
use bammarkdup_lib::bam_input::{BamReader, TeeReader};
use bammarkdup_lib::bgzf_writer::deflate_level;
use bammarkdup_lib::collator::InputObserver;
use bammarkdup_lib::header::{LibraryTable, add_program_line};
use bammarkdup_lib::logging::OperationTimer;
use bammarkdup_lib::pipeline::{PipelineConfig, collect_duplicates};
use bammarkdup_lib::progress::ProgressReporter;
use bammarkdup_lib::tempfiles::{SUFFIX_ALIGNMENTS, TempFileRegistry};

use crate::commands::command::Command;
use crate::version::VERSION;

/// Program name used for the `@PG` line and temp file defaults.
const PROGRAM_NAME: &str = "bammarkduplicates";

/// Mark PCR and optical duplicates in a BAM stream.
#[derive(Debug, Parser)]
#[command(
    name = PROGRAM_NAME,
    version,
    styles = crate::STYLES,
    about = "Mark PCR and optical duplicates in a BAM stream",
    long_about = r"
Reads a BAM stream (any record order), identifies PCR and optical
duplicates among fragments and mate pairs, and writes the stream back out
with the duplicate flag (0x400) set on every duplicate, or with duplicates
removed. A per-library metrics report accompanies the output.

Mate pairs are collated in a single pass; read-end signatures are sorted
on disk, so memory use is bounded regardless of input size. When the
input is a file, the second pass re-reads it and patches flag bytes
inside re-coded BGZF blocks, leaving every other byte untouched.
"
)]
pub struct MarkDuplicates {
    /// Input BAM file (stdin when omitted)
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    /// Output BAM file (stdout when omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Metrics file (stderr when omitted)
    #[arg(short = 'M', long = "metrics")]
    pub metrics: Option<PathBuf>,

    /// Prefix for temporary files (defaults to the working directory)
    #[arg(long = "tmp-prefix")]
    pub tmp_prefix: Option<PathBuf>,

    /// Output BGZF compression level (-1 default, 0 store, 1 fast, 9 best)
    #[arg(long = "level", default_value_t = -1, allow_hyphen_values = true)]
    pub level: i32,

    /// BGZF codec worker threads for the marking pass
    #[arg(long = "mark-threads", default_value_t = 1)]
    pub mark_threads: usize,

    /// Progress report verbosity (0 silences progress lines)
    #[arg(long = "verbose", default_value_t = 1)]
    pub verbose: u8,

    /// Records between progress reports
    #[arg(long = "progress-window", default_value_t = 1_048_576)]
    pub progress_window: u64,

    /// Intermediate store for stdin input: 0 compressed records, 1 BAM
    /// re-encode, 2 verbatim copy of the compressed input
    #[arg(long = "rewrite-bam", default_value_t = 0)]
    pub rewrite_bam: u8,

    /// BGZF level for the intermediate BAM when --rewrite-bam 1
    #[arg(long = "rewrite-bam-level", default_value_t = -1, allow_hyphen_values = true)]
    pub rewrite_bam_level: i32,

    /// Remove duplicates instead of flagging them
    #[arg(short = 'r', long = "remove-duplicates", default_value_t = false)]
    pub remove_duplicates: bool,

    /// log2 of the collation hash table size
    #[arg(long = "col-hash-bits", default_value_t = 20)]
    pub col_hash_bits: u32,

    /// Collation spill buffer size in bytes
    #[arg(long = "col-list-size", default_value_t = 32 * 1024 * 1024)]
    pub col_list_size: usize,

    /// Read-end sort buffer size in bytes
    #[arg(long = "frag-buf-size", default_value_t = 48 * 1024 * 1024)]
    pub frag_buf_size: usize,

    /// Pixel window for optical-duplicate detection
    #[arg(long = "opt-pixel-dist", default_value_t = 100)]
    pub opt_pixel_dist: u32,
}

/// The intermediate record capture for stdin input.
enum Capture {
    /// Input is a seekable file; nothing to capture.
    None,
    /// zstd stream of raw records (`--rewrite-bam 0`).
    Zstd(ZstdStoreWriter),
    /// Re-encoded BAM (`--rewrite-bam 1`).
    Bam(BamStoreWriter),
    /// Verbatim compressed copy written by a tee (`--rewrite-bam 2`).
    Tee,
}

impl MarkDuplicates {
    fn validate(&self) -> Result<()> {
        for (value, name) in
            [(self.level, "--level"), (self.rewrite_bam_level, "--rewrite-bam-level")]
        {
            if !matches!(value, -1 | 0 | 1 | 9) {
                bail!(MarkDupError::config(format!(
                    "{name} must be -1 (default), 0 (store), 1 (fast) or 9 (best), got {value}"
                )));
            }
        }
        if self.rewrite_bam > 2 {
            bail!(MarkDupError::config(format!(
                "--rewrite-bam must be 0, 1 or 2, got {}",
                self.rewrite_bam
            )));
        }
        if self.col_hash_bits == 0 || self.col_hash_bits > 30 {
            bail!(MarkDupError::config(format!(
                "--col-hash-bits must be between 1 and 30, got {}",
                self.col_hash_bits
            )));
        }
        if self.mark_threads == 0 {
            bail!(MarkDupError::config("--mark-threads must be at least 1"));
        }
        if self.input.is_none() && io::stdin().is_terminal() {
            bail!(MarkDupError::config(
                "refusing to read BAM data from a terminal; use --input or redirect stdin"
            ));
        }
        if self.output.is_none() && io::stdout().is_terminal() {
            bail!(MarkDupError::config(
                "refusing to write BAM data to a terminal; use --output or redirect stdout"
            ));
        }
        Ok(())
    }

    fn temp_prefix(&self) -> PathBuf {
        self.tmp_prefix
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{PROGRAM_NAME}_tmp_{}", std::process::id())))
    }

    fn open_output(&self) -> Result<Box<dyn Write + Send>> {
        Ok(match &self.output {
            Some(path) => Box::new(BufWriter::new(
                File::create(path)
                    .with_context(|| format!("cannot create output '{}'", path.display()))?,
            )),
            None => Box::new(BufWriter::new(io::stdout())),
        })
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            col_hash_bits: self.col_hash_bits,
            col_list_size: self.col_list_size,
            frag_buf_size: self.frag_buf_size,
            optical_pixel_distance: self.opt_pixel_dist,
            parallel_sort: self.mark_threads > 1,
            verbose: self.verbose > 0,
            progress_window: self.progress_window,
        }
    }
}

impl Command for MarkDuplicates {
    fn execute(&self, command_line: &str) -> Result<()> {
        self.validate()?;

        let timer = OperationTimer::new("Marking duplicates");
        let mut registry = TempFileRegistry::new(self.temp_prefix());
        let align_path = registry.path(SUFFIX_ALIGNMENTS);

        // First pass input, with capture when reading a pipe.
        let from_file = self.input.is_some();
        let (mut reader, mut capture): (BamReader<Box<dyn Read>>, Capture) =
            match &self.input {
                Some(path) => {
                    let file = File::open(path)
                        .with_context(|| format!("cannot open input '{}'", path.display()))?;
                    let boxed: Box<dyn Read> = Box::new(BufReader::new(file));
                    (BamReader::new(boxed).map_err(malformed)?, Capture::None)
                }
                None => {
                    let stdin: Box<dyn Read> = Box::new(io::stdin().lock());
                    match self.rewrite_bam {
                        2 => {
                            info!("Copying compressed input to {}", align_path.display());
                            let copy = BufWriter::new(File::create(&align_path).map_err(|e| {
                                MarkDupError::Resource { path: align_path.clone(), source: e }
                            })?);
                            let tee: Box<dyn Read> = Box::new(TeeReader::new(stdin, copy));
                            (BamReader::new(tee).map_err(malformed)?, Capture::Tee)
                        }
                        mode => {
                            let reader = BamReader::new(stdin).map_err(malformed)?;
                            let capture = if mode == 1 {
                                info!("Re-encoding alignments to {}", align_path.display());
                                Capture::Bam(BamStoreWriter::create(
                                    &align_path,
                                    &reader.header().text,
                                    &reader.header().references,
                                    deflate_level(self.rewrite_bam_level),
                                )?)
                            } else {
                                info!("Storing alignments in {}", align_path.display());
                                Capture::Zstd(ZstdStoreWriter::create(&align_path)?)
                            };
                            (reader, capture)
                        }
                    }
                }
            };

        let header_text = reader.header().text.clone();
        let references = reader.header().references.clone();
        let libraries = LibraryTable::from_header_text(&header_text);
        info!(
            "Input header: {} references, {} libraries",
            references.len(),
            libraries.library_count()
        );

        // Detection pass.
        let observer: Option<&mut dyn InputObserver> = match &mut capture {
            Capture::Zstd(store) => Some(store),
            Capture::Bam(store) => Some(store),
            Capture::None | Capture::Tee => None,
        };
        let result = collect_duplicates(
            &mut reader,
            &libraries,
            observer,
            &mut registry,
            &self.pipeline_config(),
        )
        .map_err(malformed)?;

        drop(reader); // flushes the tee copy in --rewrite-bam 2
        match capture {
            Capture::Zstd(store) => store.finish()?,
            Capture::Bam(store) => store.finish()?,
            Capture::None | Capture::Tee => {}
        }

        // Metrics report.
        match &self.metrics {
            Some(path) => {
                let mut out = BufWriter::new(File::create(path).with_context(|| {
                    format!("cannot create metrics file '{}'", path.display())
                })?);
                result.metrics.write_report(&mut out, &libraries, command_line)?;
            }
            None => {
                result.metrics.write_report(&mut io::stderr().lock(), &libraries, command_line)?;
            }
        }

        // Second pass: apply the bitmap.
        let new_header_text = add_program_line(&header_text, PROGRAM_NAME, VERSION, command_line);
        let output = self.open_output()?;
        let mut progress = ProgressReporter::new("Marked", self.progress_window, self.verbose > 0)
            .with_total(result.records);
        let level = deflate_level(self.level);
        let patchable_temp = !from_file && self.rewrite_bam >= 1;
        let second_pass_path = if from_file {
            self.input.clone().expect("from_file implies --input")
        } else {
            align_path.clone()
        };

        let applied = if self.remove_duplicates {
            // Removal always re-serializes record by record.
            if from_file || patchable_temp {
                let mut source = BamReader::new(BufReader::new(File::open(&second_pass_path)?))
                    .map_err(malformed)?;
                rewrite_stream(
                    &mut source,
                    output,
                    &result.bitmap,
                    &new_header_text,
                    &references,
                    level,
                    true,
                    &mut progress,
                )?
            } else {
                let mut source = ZstdStoreReader::open(&align_path)?;
                rewrite_stream(
                    &mut source,
                    output,
                    &result.bitmap,
                    &new_header_text,
                    &references,
                    level,
                    true,
                    &mut progress,
                )?
            }
        } else if from_file || patchable_temp {
            let input = BufReader::new(File::open(&second_pass_path).with_context(|| {
                format!("cannot reopen '{}'", second_pass_path.display())
            })?);
            if self.mark_threads > 1 {
                patch_stream_parallel(
                    input,
                    output,
                    &result.bitmap,
                    &new_header_text,
                    level,
                    self.mark_threads,
                    &mut progress,
                )
                .map_err(malformed)?
            } else {
                patch_stream(input, output, &result.bitmap, &new_header_text, level, &mut progress)
                    .map_err(malformed)?
            }
        } else {
            info!("Rewriting stored alignments from {}", align_path.display());
            let mut source = ZstdStoreReader::open(&align_path)?;
            rewrite_stream(
                &mut source,
                output,
                &result.bitmap,
                &new_header_text,
                &references,
                level,
                false,
                &mut progress,
            )?
        };

        if applied != result.records {
            bail!(MarkDupError::malformed(format!(
                "second pass saw {applied} records where the first saw {}",
                result.records
            )));
        }

        drop(registry);
        timer.log_completion(result.records);
        Ok(())
    }
}

fn malformed(e: io::Error) -> MarkDupError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            MarkDupError::malformed(e.to_string())
        }
        _ => MarkDupError::Io(e),
    }
}

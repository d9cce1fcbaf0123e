#![deny(unsafe_code)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

//! # bammarkdup_lib - duplicate marking for BAM streams
//!
//! Core library behind the `bammarkduplicates` binary. One pass collates
//! mate pairs out of an arbitrarily ordered BAM stream and projects them
//! into sorted read-end signatures; the rule engine derives a duplicate
//! bitmap from those; a second pass applies the bitmap back onto the
//! original bytes.
//!
//! ## Pipeline modules
//!
//! - [`pipeline`] - the detection pass wired end to end
//! - [`collator`] - single-pass mate pairing with spill-to-disk
//! - [`position_tracker`] - coordinate-window buffering of simple pairs
//! - [`read_ends`] / [`ends_container`] - signatures and their external sort
//! - [`dup_engine`] - pair/fragment duplicate rules, optical detection
//! - [`bitmap`] - duplicate rank sinks
//! - [`applicator`] - BGZF fast-patch and full-rewrite output
//! - [`metrics`] - per-library counters and the rendered report
//!
//! ## Infrastructure
//!
//! - [`bgzf_reader`] / [`bgzf_writer`] - raw BGZF block codec
//! - [`bam_input`] - streaming BAM record reader
//! - [`record`] - zero-copy field access over raw record bytes
//! - [`header`] - text-level `@PG` chaining and the library table
//! - [`alignment_store`] - intermediate record capture for stdin input
//! - [`tempfiles`] - temp path registry with removal on drop

pub mod alignment_store;
pub mod applicator;
pub mod bam_input;
pub mod bgzf_reader;
pub mod bgzf_writer;
pub mod bitmap;
pub mod collator;
pub mod dup_engine;
pub mod ends_container;
pub mod errors;
pub mod header;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod position_tracker;
pub mod progress;
pub mod read_ends;
pub mod record;
pub mod tempfiles;
pub mod test_support;

pub use errors::{MarkDupError, Result};

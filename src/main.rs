#![deny(unsafe_code)]
mod commands;
mod version;

use anyhow::Result;
use clap::Parser;
use clap::builder::styling::{AnsiColor, Effects, Styles};
use env_logger::Env;
use log::info;

use commands::command::Command;
use commands::markdup::MarkDuplicates;

/// Custom styles for CLI help output
pub(crate) const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // Capture the full command line BEFORE clap parsing for the @PG record
    let command_line = std::env::args().collect::<Vec<_>>().join(" ");

    let command = MarkDuplicates::parse();

    info!("Running bammarkduplicates version {}", version::VERSION);
    command.execute(&command_line)
}

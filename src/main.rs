//! vmpatch CLI - address space statistics for the current process.
//!
//! The patching half of the library is meant to run inside a host process; this binary
//! exposes the read-only parts: the address-space report and the protection decoder.

use bytesize::ByteSize;
use clap::{Parser, Subcommand};

use vmpatch::memory::{AddressBounds, AddressSpace, CurrentProcess, PAGE_SIZE};
use vmpatch::{protection, report, walk_range};

/// Address-space statistics and page protection decoding.
#[derive(Parser)]
#[command(name = "vmpatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk this process's address space and print the statistics report
    Stats {
        /// First address to walk (hex with 0x, or decimal)
        #[arg(long, value_parser = parse_address)]
        from: Option<usize>,

        /// Address to stop at (hex with 0x, or decimal)
        #[arg(long, value_parser = parse_address)]
        to: Option<usize>,
    },

    /// Walk this process's address space and print only the free-span histogram
    Histogram,

    /// Decode a PAGE_* protection value into its symbolic form
    Protect {
        /// Protection value, e.g. 0x140
        value: String,
    },
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Stats { from, to } => stats(from, to)?,
        Commands::Histogram => histogram()?,
        Commands::Protect { value } => decode(&value)?,
    }

    Ok(())
}

fn stats(from: Option<usize>, to: Option<usize>) -> anyhow::Result<()> {
    let memory = CurrentProcess::new();
    let default = memory.bounds();
    let bounds = AddressBounds::new(
        from.unwrap_or(default.lowest),
        to.unwrap_or(default.highest),
    );

    if bounds.is_empty() {
        anyhow::bail!("empty address range 0x{:X} - 0x{:X}", bounds.lowest, bounds.highest);
    }

    println!(
        "Walking 0x{:X} - 0x{:X} ({})",
        bounds.lowest,
        bounds.highest,
        ByteSize::b(bounds.len() as u64)
    );

    let snapshot = walk_range(&memory, bounds)?;

    println!();
    print!("{}", report::render(&snapshot, bounds.len() as u64));
    println!();
    println!(
        "Scanned {} in {} pages",
        ByteSize::b(snapshot.total_pages() * PAGE_SIZE as u64),
        snapshot.total_pages()
    );

    Ok(())
}

fn histogram() -> anyhow::Result<()> {
    let memory = CurrentProcess::new();
    let bounds = memory.bounds();
    let snapshot = walk_range(&memory, bounds)?;

    print!("{}", report::render_histogram(&snapshot, bounds.len() as u64));
    println!();
    println!(
        "{} free in {} spans",
        ByteSize::b(snapshot.free_pages * PAGE_SIZE as u64),
        snapshot.free_span_histogram.iter().sum::<u64>()
    );

    Ok(())
}

fn decode(value: &str) -> anyhow::Result<()> {
    let raw = protection::parse(value)
        .ok_or_else(|| anyhow::anyhow!("not a protection value: {}", value))?;
    println!("0x{:X} = {}", raw, protection::describe(raw));
    Ok(())
}

fn parse_address(text: &str) -> Result<usize, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", text, e))
}

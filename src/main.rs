//! Utility CLI for inspecting and building rangerdb index files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rangerdb::{RangerDb, RecordFileReader, RecordSource, BATCH_SIZE};

#[derive(Parser)]
#[command(name = "rangerdb", about = "Utilities for rangerdb index files")]
struct Cli {
    /// Input filename.
    #[arg(long)]
    file: PathBuf,

    /// Output filename.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Random seed; 0 picks one from the OS.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Output gzip compression factor in [0,9]; 0 stores uncompressed.
    #[arg(long, default_value_t = 0)]
    factor: u32,

    /// General purpose numeric knob: compression factor for build-db
    /// (default 16), access count for perf-test (default 1000000).
    #[arg(long, default_value_t = 0)]
    n1: u64,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Treat the input as a record file and print its records.
    PrintRecords,
    /// Treat the input as a record file and build an index db file.
    BuildDb,
    /// Treat the input as an index db file and print its ranges.
    ExtractRanges,
    /// Treat the input as an index db file and run random accesses,
    /// printing per-stage performance statistics.
    PerfTest,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let seed = if cli.seed != 0 {
        cli.seed
    } else {
        rand::rngs::OsRng.gen()
    };
    tracing::info!("running with seed {seed}");

    match cli.mode {
        Mode::PrintRecords => print_records(&cli),
        Mode::BuildDb => build_db(&cli),
        Mode::ExtractRanges => extract_ranges(&cli),
        Mode::PerfTest => perf_test(&cli, seed),
    }
}

fn print_records(cli: &Cli) -> Result<()> {
    let mut records = RecordFileReader::open(&cli.file)?;
    println!("Total {} records", records.size());
    while let Some(m) = records.next_record() {
        println!("{:14} {:14}", m.key, m.value);
    }
    Ok(())
}

fn build_db(cli: &Cli) -> Result<()> {
    let out = cli
        .out
        .as_ref()
        .context("build-db requires --out")?;
    let compression = if cli.n1 != 0 { cli.n1 as u32 } else { 16 };

    let mut records = RecordFileReader::open(&cli.file)?;
    let key_num = records.size() as usize;
    tracing::info!("building database from {key_num} records...");

    let start = std::time::Instant::now();
    let db = RangerDb::build(key_num, true, compression, &mut records)?;
    tracing::info!("build time: {:.3} sec", start.elapsed().as_secs_f64());

    tracing::info!(
        "saving to '{}' (gzip compression factor: {})...",
        out.display(),
        cli.factor
    );
    let start = std::time::Instant::now();
    db.save(out, cli.factor)?;
    tracing::info!("save time: {:.3} ms", start.elapsed().as_secs_f64() * 1e3);
    Ok(())
}

fn extract_ranges(cli: &Cli) -> Result<()> {
    let out = cli
        .out
        .as_ref()
        .context("extract-ranges requires --out")?;

    tracing::info!("reading db file from '{}'...", cli.file.display());
    let db = RangerDb::load(&cli.file)?;

    tracing::info!("writing ranges to '{}'...", out.display());
    let mut sink = BufWriter::new(File::create(out)?);
    for range in db.extract_ranges() {
        writeln!(sink, "{range}")?;
    }
    sink.flush()?;
    Ok(())
}

fn perf_test(cli: &Cli, seed: u64) -> Result<()> {
    let count = if cli.n1 != 0 { cli.n1 } else { 1_000_000 };

    tracing::info!("reading db file from '{}'...", cli.file.display());
    let mut db = RangerDb::load(&cli.file)?;

    let ranges = db.extract_ranges();
    if ranges.is_empty() {
        bail!("database has no ranges");
    }
    let min = ranges[0];
    let max = *ranges.last().unwrap();
    let diff = (max - min).max(1);

    tracing::info!("performing {count} random query batches...");
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut keys = [0u64; BATCH_SIZE];
    for _ in 0..count {
        for key in keys.iter_mut() {
            *key = min + rng.gen_range(0..diff);
        }
        let _ = db.query_perf(&keys);
    }

    println!("Stats: {}", db.perf_string());
    Ok(())
}

//! Stress runner: replays the known regression scenarios against a
//! backing file (or an existing block device), then a seeded random
//! write/discard stream, checking the device against the interval model
//! after every step.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sectorio_block::{BlockHandle, Buffering, SECTOR_SIZE};
use sectorio_harness::{dump_paths, random_steps, Step, StressDriver};

#[derive(Parser, Debug)]
#[command(name = "sectorio-stress", about, version)]
struct Args {
    /// Backing store: a regular file (created/truncated unless it is a
    /// block device) or a raw block device
    #[arg(long)]
    path: PathBuf,

    /// Device size in sectors (ignored for block devices)
    #[arg(long, default_value_t = 65536)]
    sectors: u64,

    /// Number of random steps after the scripted scenarios
    #[arg(long, default_value_t = 1000)]
    iterations: usize,

    /// RNG seed for the random step stream
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Verbose step-by-step logging
    #[arg(long)]
    debug: bool,
}

/// The fixed scenario exercising the discard edge cases: unaligned and
/// aligned discards, re-writes into freed ranges, and the aligned
/// re-discard history.
fn scripted_steps() -> Vec<Step> {
    vec![
        Step::Write { sector: 0, count: 1 },
        Step::Discard { sector: 8, count: 8 },
        Step::Write { sector: 8, count: 1 },
        Step::Write { sector: 16, count: 1 },
        Step::Discard { sector: 16, count: 8 },
        // already-free, aligned re-discard
        Step::Discard { sector: 16, count: 8 },
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    prepare_backing_store(&args)?;

    let handle = BlockHandle::connect(&args.path, true, Buffering::default())
        .await
        .context("connect to backing store")?;
    let info = handle.info();
    anyhow::ensure!(info.read_write, "backing store opened read-only");
    anyhow::ensure!(
        info.size_sectors >= 24,
        "need at least 24 sectors, got {}",
        info.size_sectors
    );
    info!(
        path = %args.path.display(),
        size_sectors = info.size_sectors,
        "starting stress run"
    );

    let mut driver = StressDriver::new(Arc::new(handle));

    driver
        .run(&scripted_steps())
        .await
        .context("scripted scenario failed")?;

    let mut rng = rand::rngs::StdRng::seed_from_u64(args.seed);
    let steps = random_steps(&mut rng, info.size_sectors, args.iterations);
    driver
        .run(&steps)
        .await
        .with_context(|| {
            let (live, free) = dump_paths();
            format!(
                "random run failed (seed {}); interval dumps at {} and {}",
                args.seed,
                live.display(),
                free.display()
            )
        })?;

    info!(
        iterations = args.iterations,
        live_sectors = driver.live().total_sectors(),
        free_sectors = driver.free().total_sectors(),
        "stress run passed"
    );
    Ok(())
}

/// Create/size a regular backing file; leave block devices untouched.
fn prepare_backing_store(args: &Args) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    if let Ok(meta) = std::fs::metadata(&args.path) {
        if meta.file_type().is_block_device() {
            return Ok(());
        }
    }
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.path)
        .with_context(|| format!("create backing file {}", args.path.display()))?;
    file.set_len(args.sectors * SECTOR_SIZE)
        .context("size backing file")?;
    Ok(())
}

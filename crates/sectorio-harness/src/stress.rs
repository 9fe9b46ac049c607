//! Stress driver: scripted and randomized write/discard replay
//!
//! The driver executes steps against a real [`BlockHandle`] while
//! maintaining a LIVE/FREE interval model of the sector space. A sector is
//! LIVE after a successful write (stamped with its own sector index, which
//! catches misrouted and aliased transfers) and FREE after a successful
//! discard (must read back zero). Before every step, and once more at the
//! end, `check` reads back the whole device and compares it to the model.
//!
//! The model is only mutated after the device operation completes; steps
//! run strictly one at a time, so no model update ever races a pending
//! operation on the same region.
//!
//! On failure both interval sets are serialized to fixed well-known paths
//! and the backing store is deliberately left behind for postmortem.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, error, info};

use sectorio_block::{BlockError, BlockHandle, SECTOR_SIZE};

use crate::interval::{Interval, IntervalSet};

/// Sectors read back per transfer while checking an interval.
const CHECK_CHUNK_SECTORS: u64 = 256;

/// Default deadline for a single check read. The timeout races the read
/// but cannot abort the underlying syscall; a timeout win is reported as
/// a hang, not a true cancellation.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// One scripted operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Write { sector: u64, count: u64 },
    Discard { sector: u64, count: u64 },
}

/// Stress harness failure classes. A hang (timeout) is distinct from a
/// data mismatch.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Device(#[from] BlockError),

    #[error("check timed out after {timeout:?} while reading {interval}")]
    Timeout {
        timeout: Duration,
        interval: Interval,
    },

    #[error("sector {sector}: {detail}")]
    Mismatch { sector: u64, detail: String },

    #[error("step {step:?} exceeds device of {size_sectors} sectors")]
    OutOfRange { step: Step, size_sectors: u64 },
}

/// Fixed diagnostic paths for the LIVE and FREE dumps.
pub fn dump_paths() -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir();
    (
        dir.join("sectorio-live.json"),
        dir.join("sectorio-free.json"),
    )
}

/// One sector's expected content: the sector index in the first 8 bytes
/// (little endian), zero elsewhere.
pub fn stamped_sector(index: u64) -> Bytes {
    let mut buf = vec![0u8; SECTOR_SIZE as usize];
    buf[..8].copy_from_slice(&index.to_le_bytes());
    Bytes::from(buf)
}

/// Replays write/discard steps against a device, validating against the
/// LIVE/FREE model after each one.
pub struct StressDriver {
    handle: Arc<BlockHandle>,
    size_sectors: u64,
    live: IntervalSet,
    free: IntervalSet,
    check_timeout: Duration,
}

impl StressDriver {
    /// Start with an all-FREE model over the handle's sector space.
    pub fn new(handle: Arc<BlockHandle>) -> Self {
        let size_sectors = handle.info().size_sectors;
        assert!(size_sectors > 0, "cannot stress an empty device");
        let mut free = IntervalSet::new();
        free.insert(Interval::new(0, size_sectors - 1));
        Self {
            handle,
            size_sectors,
            live: IntervalSet::new(),
            free,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn live(&self) -> &IntervalSet {
        &self.live
    }

    pub fn free(&self) -> &IntervalSet {
        &self.free
    }

    /// LIVE and FREE are disjoint and together cover the sector space.
    pub fn partition_holds(&self) -> bool {
        if self.live.total_sectors() + self.free.total_sectors() != self.size_sectors {
            return false;
        }
        let mut union = self.live.clone();
        for iv in self.free.iter() {
            union.insert(iv);
        }
        union.to_intervals() == vec![Interval::new(0, self.size_sectors - 1)]
    }

    /// Run `steps`, checking the whole device before each step and after
    /// the last. On failure, dump both interval sets and re-raise; the
    /// backing store is left as-is for postmortem.
    pub async fn run(&mut self, steps: &[Step]) -> Result<(), HarnessError> {
        let result = self.run_inner(steps).await;
        if let Err(e) = &result {
            error!(error = %e, "stress run failed");
            self.dump_sets();
        }
        result
    }

    async fn run_inner(&mut self, steps: &[Step]) -> Result<(), HarnessError> {
        for (i, step) in steps.iter().enumerate() {
            self.check().await?;
            debug!(index = i, ?step, "applying");
            self.apply(*step).await?;
        }
        self.check().await?;
        info!(steps = steps.len(), "stress run passed");
        Ok(())
    }

    /// Execute one step and, once it succeeds, update the model.
    pub async fn apply(&mut self, step: Step) -> Result<(), HarnessError> {
        let (sector, count) = match step {
            Step::Write { sector, count } | Step::Discard { sector, count } => (sector, count),
        };
        if count == 0 {
            return Ok(());
        }
        if sector.checked_add(count).map_or(true, |end| end > self.size_sectors) {
            return Err(HarnessError::OutOfRange {
                step,
                size_sectors: self.size_sectors,
            });
        }
        let span = Interval::span(sector, count);
        match step {
            Step::Write { .. } => {
                let mut buf = BytesMut::with_capacity((count * SECTOR_SIZE) as usize);
                for s in sector..sector + count {
                    buf.extend_from_slice(&stamped_sector(s));
                }
                self.handle.write(sector, &[buf.freeze()]).await?;
                self.free.remove(span);
                self.live.insert(span);
            }
            Step::Discard { .. } => {
                self.handle
                    .discard(sector * SECTOR_SIZE, count * SECTOR_SIZE)
                    .await?;
                self.live.remove(span);
                self.free.insert(span);
            }
        }
        Ok(())
    }

    /// Read back every maximal FREE interval (expect zero) and every
    /// maximal LIVE interval (expect each sector's own stamp).
    pub async fn check(&self) -> Result<(), HarnessError> {
        if !self.partition_holds() {
            return Err(HarnessError::Mismatch {
                sector: 0,
                detail: format!(
                    "model invariant broken: LIVE {} and FREE {} do not partition [0, {})",
                    self.live, self.free, self.size_sectors
                ),
            });
        }
        for iv in self.free.iter() {
            self.check_interval(iv, Expectation::Zero).await?;
        }
        for iv in self.live.iter() {
            self.check_interval(iv, Expectation::Stamp).await?;
        }
        Ok(())
    }

    async fn check_interval(
        &self,
        interval: Interval,
        expect: Expectation,
    ) -> Result<(), HarnessError> {
        let mut sector = interval.start;
        while sector <= interval.end {
            let count = (interval.end - sector + 1).min(CHECK_CHUNK_SECTORS);
            let mut buf = BytesMut::with_capacity((count * SECTOR_SIZE) as usize);
            buf.resize((count * SECTOR_SIZE) as usize, 0xee);
            let mut bufs = vec![buf];

            let read = tokio::time::timeout(self.check_timeout, self.handle.read(sector, &mut bufs));
            match read.await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(HarnessError::Timeout {
                        timeout: self.check_timeout,
                        interval,
                    });
                }
            }

            let data = &bufs[0];
            for i in 0..count {
                let s = sector + i;
                let chunk =
                    &data[(i * SECTOR_SIZE) as usize..((i + 1) * SECTOR_SIZE) as usize];
                verify_sector(s, chunk, expect)?;
            }
            sector += count;
        }
        Ok(())
    }

    /// Serialize both sets to the fixed diagnostic paths. Best effort;
    /// dump failures are logged, never override the original error.
    fn dump_sets(&self) {
        let (live_path, free_path) = dump_paths();
        for (path, set) in [(&live_path, &self.live), (&free_path, &self.free)] {
            match serde_json::to_string_pretty(&set.to_intervals()) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(path, json) {
                        error!(path = %path.display(), error = %e, "failed to write dump");
                    } else {
                        info!(path = %path.display(), "wrote interval dump");
                    }
                }
                Err(e) => error!(error = %e, "failed to serialize interval set"),
            }
        }
        info!(
            device = %self.handle.path(),
            "backing store left in place for postmortem"
        );
    }
}

#[derive(Clone, Copy, Debug)]
enum Expectation {
    Zero,
    Stamp,
}

fn verify_sector(sector: u64, data: &[u8], expect: Expectation) -> Result<(), HarnessError> {
    match expect {
        Expectation::Zero => {
            if let Some(pos) = data.iter().position(|&b| b != 0) {
                return Err(HarnessError::Mismatch {
                    sector,
                    detail: format!(
                        "expected zero in FREE sector, found {:#04x} at byte {pos}",
                        data[pos]
                    ),
                });
            }
        }
        Expectation::Stamp => {
            let mut stamp = [0u8; 8];
            stamp.copy_from_slice(&data[..8]);
            let found = u64::from_le_bytes(stamp);
            if found != sector {
                return Err(HarnessError::Mismatch {
                    sector,
                    detail: format!("expected stamp {sector}, found {found}"),
                });
            }
            if let Some(pos) = data[8..].iter().position(|&b| b != 0) {
                return Err(HarnessError::Mismatch {
                    sector,
                    detail: format!(
                        "expected zero after stamp, found {:#04x} at byte {}",
                        data[8 + pos],
                        8 + pos
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Generate `n` random in-range steps, counts capped at 64 sectors.
pub fn random_steps(rng: &mut impl Rng, size_sectors: u64, n: usize) -> Vec<Step> {
    assert!(size_sectors > 0);
    (0..n)
        .map(|_| {
            let sector = rng.gen_range(0..size_sectors);
            let max_count = (size_sectors - sector).min(64);
            let count = rng.gen_range(1..=max_count);
            if rng.gen_bool(0.5) {
                Step::Write { sector, count }
            } else {
                Step::Discard { sector, count }
            }
        })
        .collect()
}

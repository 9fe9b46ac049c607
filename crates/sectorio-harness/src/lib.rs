//! Sectorio stress harness
//!
//! A self-checking model of "which sectors are currently meaningful" and
//! a driver that replays scripted or randomized write/discard sequences
//! against a real [`sectorio_block::BlockHandle`], validating the device
//! against the model after every step.

pub mod interval;
pub mod stress;

pub use interval::{Interval, IntervalSet};
pub use stress::{
    dump_paths, random_steps, stamped_sector, HarnessError, Step, StressDriver,
    DEFAULT_CHECK_TIMEOUT,
};

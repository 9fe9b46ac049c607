//! Sectorio block layer
//!
//! Asynchronous sector-addressed read/write and space reclamation
//! (discard/hole-punch) over a backing regular file or raw block device.
//! This is the storage substrate for a VM or embedded runtime: a flat
//! sector address space, no files, no directories, no metadata.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │         BlockHandle          │  read / write / discard / flush
//! │  ┌────────────┐ ┌─────────┐  │
//! │  │ Descriptor │ │ Discard │  │
//! │  │   Pool     │ │ Engine  │  │
//! │  └─────┬──────┘ └────┬────┘  │
//! │        │   Transfer  │       │
//! │        │     Loop    │       │
//! └────────┼─────────────┼───────┘
//!          ▼             ▼
//!    pread / pwrite   fallocate / BLKDISCARD / F_PUNCHHOLE
//! ```
//!
//! Concurrency is bounded by the descriptor pool: up to `POOL_SIZE + 1`
//! transfers are in flight per handle, further callers suspend at acquire.
//! A descriptor is never observed by two operations at once.

pub mod device;
pub mod discard;
pub mod error;
pub mod pool;
mod transfer;

pub use device::{BlockHandle, Buffering, DeviceInfo, SECTOR_SIZE};
pub use error::{BlockError, BlockResult};
pub use pool::POOL_SIZE;

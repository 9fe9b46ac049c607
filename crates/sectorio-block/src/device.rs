//! Block handle: lifecycle, sector-addressed read/write, discard
//!
//! A [`BlockHandle`] owns a bounded pool of descriptors to one backing
//! store (regular file or raw block device) and exposes asynchronous
//! sector-addressed operations over it. Every positioned syscall runs on
//! the blocking thread pool; callers suspend there and at descriptor
//! acquisition when all descriptors are in flight.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use crate::discard;
use crate::error::{BlockError, BlockResult};
use crate::pool::{DescriptorPool, POOL_SIZE};
use crate::transfer::{read_full_at, write_full_at};

/// Logical sector size in bytes. This is the addressing convention of the
/// API, independent of the backend's physical block size (which the
/// discard engine queries separately).
pub const SECTOR_SIZE: u64 = 512;

/// Cache behavior for regular-file backends.
///
/// `Unbuffered` (the default) asks the OS not to cache file data where the
/// platform supports a per-descriptor hint (`F_NOCACHE` on macOS); at this
/// logical layer it never imposes direct-I/O alignment constraints on
/// callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Buffering {
    Buffered,
    #[default]
    Unbuffered,
}

/// Backend kind, probed once at connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BackendKind {
    RegularFile,
    BlockDevice,
}

/// Immutable device geometry, fixed at connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Whether the handle accepts writes
    pub read_write: bool,
    /// Bytes per logical sector
    pub sector_size: u64,
    /// Device size in logical sectors
    pub size_sectors: u64,
}

/// Async handle to a sector-addressed backing store.
#[derive(Debug)]
pub struct BlockHandle {
    path: String,
    info: DeviceInfo,
    kind: BackendKind,
    pool: DescriptorPool,
    disconnected: AtomicBool,
}

impl BlockHandle {
    /// Open the backing store at `path`.
    ///
    /// Prefers read-write access and falls back to read-only if the
    /// read-write open fails; `info().read_write` reports the outcome.
    /// Opens the probe descriptor plus [`POOL_SIZE`] pooled descriptors,
    /// all independent, all positioned explicitly per transfer.
    pub async fn connect(
        path: impl AsRef<Path>,
        read_write: bool,
        buffering: Buffering,
    ) -> BlockResult<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        tokio::task::spawn_blocking(move || Self::connect_blocking(&path, read_write, buffering))
            .await
            .map_err(|e| BlockError::unknown("connect", "<unknown>", 0, 0, io::Error::other(e)))?
    }

    fn connect_blocking(path: &str, read_write: bool, buffering: Buffering) -> BlockResult<Self> {
        let (probe, read_write) = open_descriptor(path, read_write, buffering)?;

        let metadata = probe
            .metadata()
            .map_err(|e| BlockError::unknown("connect/stat", path, 0, 0, e))?;
        let kind = {
            use std::os::unix::fs::FileTypeExt;
            if metadata.file_type().is_block_device() {
                BackendKind::BlockDevice
            } else {
                BackendKind::RegularFile
            }
        };
        let size_bytes = match kind {
            BackendKind::RegularFile => metadata.len(),
            BackendKind::BlockDevice => block_device_size(&probe, path)?,
        };
        let info = DeviceInfo {
            read_write,
            sector_size: SECTOR_SIZE,
            size_sectors: size_bytes / SECTOR_SIZE,
        };

        let mut descriptors = Vec::with_capacity(POOL_SIZE + 1);
        descriptors.push(Arc::new(probe));
        for _ in 0..POOL_SIZE {
            let (file, _) = open_descriptor(path, read_write, buffering)?;
            descriptors.push(Arc::new(file));
        }

        info!(
            path,
            read_write,
            size_sectors = info.size_sectors,
            backend = ?kind,
            "connected block handle"
        );
        Ok(Self {
            path: path.to_string(),
            info,
            kind,
            pool: DescriptorPool::new(descriptors),
            disconnected: AtomicBool::new(false),
        })
    }

    /// Immutable geometry snapshot.
    pub fn info(&self) -> DeviceInfo {
        self.info
    }

    /// Path this handle was connected to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read into `bufs` starting at `start_sector`. Buffer `i + 1` begins
    /// exactly where buffer `i` ends; completed buffers keep their data
    /// even when a later buffer fails.
    pub async fn read(&self, start_sector: u64, bufs: &mut [BytesMut]) -> BlockResult<()> {
        self.ensure_connected()?;
        let mut offset = self.range_checked(start_sector, byte_total_mut(bufs))?;

        let fd = self.pool.acquire().await?;
        for buf in bufs.iter_mut() {
            let length = buf.len() as u64;
            let file = fd.file();
            let path = self.path.clone();
            let mut owned = std::mem::take(buf);
            let (owned, result) = tokio::task::spawn_blocking(move || {
                let result = read_full_at(&file, "read", &path, offset, &mut owned);
                (owned, result)
            })
            .await
            .map_err(|e| {
                BlockError::unknown("read", self.path.clone(), offset, length, io::Error::other(e))
            })?;
            *buf = owned;
            result?;
            offset += length;
        }
        Ok(())
    }

    /// Write `bufs` starting at `start_sector`, in order, each buffer
    /// advancing the offset by its own length.
    pub async fn write(&self, start_sector: u64, bufs: &[Bytes]) -> BlockResult<()> {
        self.ensure_connected()?;
        self.ensure_writable()?;
        let mut offset = self.range_checked(start_sector, byte_total(bufs))?;

        let fd = self.pool.acquire().await?;
        for buf in bufs {
            let length = buf.len() as u64;
            let file = fd.file();
            let path = self.path.clone();
            let owned = buf.clone();
            tokio::task::spawn_blocking(move || {
                write_full_at(&file, "write", &path, offset, &owned)
            })
            .await
            .map_err(|e| {
                BlockError::unknown(
                    "write",
                    self.path.clone(),
                    offset,
                    length,
                    io::Error::other(e),
                )
            })??;
            offset += length;
        }
        Ok(())
    }

    /// Release the storage backing the byte range `[offset, offset + length)`.
    ///
    /// Sectors in the range read back as zero afterwards; bytes outside the
    /// range are untouched. See [`crate::discard`] for the alignment
    /// decomposition.
    pub async fn discard(&self, offset: u64, length: u64) -> BlockResult<()> {
        self.ensure_connected()?;
        self.ensure_writable()?;
        let size = self.info.size_sectors * self.info.sector_size;
        if offset.checked_add(length).map_or(true, |end| end > size) {
            return Err(BlockError::OutOfBounds {
                offset,
                length,
                size,
            });
        }

        let fd = self.pool.acquire().await?;
        let file = fd.file();
        let path = self.path.clone();
        let kind = self.kind;
        tokio::task::spawn_blocking(move || {
            discard::discard_range(kind, &file, &path, offset, length)
        })
        .await
        .map_err(|e| {
            BlockError::unknown(
                "discard",
                self.path.clone(),
                offset,
                length,
                io::Error::other(e),
            )
        })?
    }

    /// Flush written data to stable storage through a pooled descriptor.
    pub async fn flush(&self) -> BlockResult<()> {
        self.ensure_connected()?;
        let fd = self.pool.acquire().await?;
        let file = fd.file();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            file.sync_data()
                .map_err(|e| BlockError::unknown("flush", path, 0, 0, e))
        })
        .await
        .map_err(|e| BlockError::unknown("flush", self.path.clone(), 0, 0, io::Error::other(e)))?
    }

    /// Close every pooled descriptor and mark the handle disconnected.
    /// One-way and idempotent; every subsequent operation fails with
    /// [`BlockError::Disconnected`] without touching the OS.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.drain();
        debug!(path = %self.path, "disconnected block handle");
    }

    fn ensure_connected(&self) -> BlockResult<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(BlockError::Disconnected);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> BlockResult<()> {
        if !self.info.read_write {
            return Err(BlockError::ReadOnly);
        }
        Ok(())
    }

    /// Validate a sector-addressed transfer and return its byte offset.
    fn range_checked(&self, start_sector: u64, total_bytes: u64) -> BlockResult<u64> {
        let size = self.info.size_sectors * self.info.sector_size;
        let offset = start_sector
            .checked_mul(self.info.sector_size)
            .ok_or(BlockError::OutOfBounds {
                offset: u64::MAX,
                length: total_bytes,
                size,
            })?;
        if offset.checked_add(total_bytes).map_or(true, |end| end > size) {
            return Err(BlockError::OutOfBounds {
                offset,
                length: total_bytes,
                size,
            });
        }
        Ok(offset)
    }
}

fn byte_total(bufs: &[Bytes]) -> u64 {
    bufs.iter().map(|b| b.len() as u64).sum()
}

fn byte_total_mut(bufs: &[BytesMut]) -> u64 {
    bufs.iter().map(|b| b.len() as u64).sum()
}

/// Open one independent descriptor, preferring read-write and falling back
/// to read-only. Returns the descriptor and the access mode obtained.
fn open_descriptor(
    path: &str,
    read_write: bool,
    buffering: Buffering,
) -> BlockResult<(File, bool)> {
    let open = |rw: bool| {
        let mut options = OpenOptions::new();
        options.read(true);
        if rw {
            options.write(true);
        }
        options.open(path)
    };

    let (file, read_write) = if read_write {
        match open(true) {
            Ok(file) => (file, true),
            // Opportunistic fallback, e.g. EACCES or a read-only filesystem.
            Err(_) => match open(false) {
                Ok(file) => (file, false),
                Err(e) => return Err(BlockError::unknown("connect/open", path, 0, 0, e)),
            },
        }
    } else {
        match open(false) {
            Ok(file) => (file, false),
            Err(e) => return Err(BlockError::unknown("connect/open", path, 0, 0, e)),
        }
    };

    if buffering == Buffering::Unbuffered {
        set_nocache(&file, path)?;
    }
    Ok((file, read_write))
}

/// Per-descriptor cache hint for unbuffered mode.
#[cfg(target_os = "macos")]
fn set_nocache(file: &File, path: &str) -> BlockResult<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if ret == -1 {
        return Err(BlockError::unknown(
            "connect/nocache",
            path,
            0,
            0,
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// No per-descriptor cache hint outside macOS; direct I/O would impose
/// alignment constraints this logical layer does not make.
#[cfg(not(target_os = "macos"))]
fn set_nocache(_file: &File, _path: &str) -> BlockResult<()> {
    Ok(())
}

/// Size of a block device via `BLKGETSIZE64`.
#[cfg(target_os = "linux")]
fn block_device_size(file: &File, path: &str) -> BlockResult<u64> {
    use std::os::unix::io::AsRawFd;

    // BLKGETSIZE64 ioctl
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
    if ret == -1 {
        return Err(BlockError::unknown(
            "connect/blkgetsize64",
            path,
            0,
            0,
            io::Error::last_os_error(),
        ));
    }
    Ok(size)
}

/// Size of a block device via seek-to-end (non-Linux fallback).
#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &File, path: &str) -> BlockResult<u64> {
    use std::io::{Seek, SeekFrom};

    let mut f = file;
    f.seek(SeekFrom::End(0))
        .map_err(|e| BlockError::unknown("connect/seek-end", path, 0, 0, e))
}

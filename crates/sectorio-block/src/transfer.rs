//! Short-transfer completion loop
//!
//! The positioned read/write syscalls may move fewer bytes than requested.
//! These loops re-issue the call at the advanced offset until the buffer is
//! fully consumed. A zero-byte transfer while bytes remain is a stall
//! (end of file or a device reporting no progress) and surfaces as
//! [`BlockError::Unknown`] with the stall offset; there is no other retry
//! policy at this layer.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use crate::error::{BlockError, BlockResult};

/// Read exactly `buf.len()` bytes starting at `offset`.
pub(crate) fn read_full_at(
    file: &File,
    op: &'static str,
    path: &str,
    offset: u64,
    buf: &mut [u8],
) -> BlockResult<()> {
    let total = buf.len() as u64;
    let mut pos = offset;
    let mut filled = 0usize;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], pos) {
            Ok(0) => {
                return Err(BlockError::unknown(
                    op,
                    path,
                    pos,
                    total,
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "end of file after {filled} of {total} bytes at offset {offset}"
                        ),
                    ),
                ));
            }
            Ok(n) => {
                filled += n;
                pos += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(BlockError::unknown(op, path, pos, total, e)),
        }
    }
    Ok(())
}

/// Write all of `buf` starting at `offset`.
pub(crate) fn write_full_at(
    file: &File,
    op: &'static str,
    path: &str,
    offset: u64,
    buf: &[u8],
) -> BlockResult<()> {
    let total = buf.len() as u64;
    let mut pos = offset;
    let mut written = 0usize;
    while written < buf.len() {
        match file.write_at(&buf[written..], pos) {
            Ok(0) => {
                return Err(BlockError::unknown(
                    op,
                    path,
                    pos,
                    total,
                    io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!(
                            "short transfer after {written} of {total} bytes at offset {offset}"
                        ),
                    ),
                ));
            }
            Ok(n) => {
                written += n;
                pos += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(BlockError::unknown(op, path, pos, total, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_round_trip() {
        let file = tempfile::tempfile().unwrap();
        write_full_at(&file, "write", "test", 1024, b"sector payload").unwrap();

        let mut buf = vec![0u8; 14];
        read_full_at(&file, "read", "test", 1024, &mut buf).unwrap();
        assert_eq!(&buf, b"sector payload");
    }

    #[test]
    fn test_read_past_eof_is_a_stall() {
        let file = tempfile::tempfile().unwrap();
        write_full_at(&file, "write", "test", 0, &[7u8; 100]).unwrap();

        // 100-byte file, ask for 200: the loop makes progress then stalls.
        let mut buf = vec![0u8; 200];
        let err = read_full_at(&file, "read", "test", 0, &mut buf).unwrap_err();
        match err {
            BlockError::Unknown {
                op,
                offset,
                length,
                source,
                ..
            } => {
                assert_eq!(op, "read");
                assert_eq!(offset, 100);
                assert_eq!(length, 200);
                assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        // The bytes that did transfer landed before the stall.
        assert_eq!(&buf[..100], &[7u8; 100]);
    }
}

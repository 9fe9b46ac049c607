//! End-to-end read/write tests over a temp-file backing store.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use sectorio_block::{BlockError, BlockHandle, Buffering, POOL_SIZE, SECTOR_SIZE};
use tempfile::NamedTempFile;

async fn connect_sectors(sectors: u64, read_write: bool) -> (NamedTempFile, BlockHandle) {
    let tmp = NamedTempFile::new().unwrap();
    tmp.as_file().set_len(sectors * SECTOR_SIZE).unwrap();
    let handle = BlockHandle::connect(tmp.path(), read_write, Buffering::default())
        .await
        .unwrap();
    (tmp, handle)
}

/// One sector stamped with its own index in the first 8 bytes.
fn stamped_sector(index: u64) -> Bytes {
    let mut buf = vec![0u8; SECTOR_SIZE as usize];
    buf[..8].copy_from_slice(&index.to_le_bytes());
    Bytes::from(buf)
}

fn sector_buf(count: u64) -> BytesMut {
    let mut buf = BytesMut::with_capacity((count * SECTOR_SIZE) as usize);
    buf.resize((count * SECTOR_SIZE) as usize, 0xee);
    buf
}

#[tokio::test]
async fn test_write_read_round_trip() {
    let (_tmp, handle) = connect_sectors(64, true).await;

    let bufs: Vec<Bytes> = (10..14).map(stamped_sector).collect();
    handle.write(10, &bufs).await.unwrap();

    let mut read = vec![sector_buf(4)];
    handle.read(10, &mut read).await.unwrap();
    for (i, sector) in read[0].chunks(SECTOR_SIZE as usize).enumerate() {
        let expect = stamped_sector(10 + i as u64);
        assert_eq!(sector, &expect[..], "sector {} misrouted", 10 + i as u64);
    }
}

#[tokio::test]
async fn test_buffers_are_contiguous_in_order() {
    let (_tmp, handle) = connect_sectors(64, true).await;

    // Two separate write buffers must land back to back.
    handle
        .write(0, &[stamped_sector(0), stamped_sector(1)])
        .await
        .unwrap();

    let mut read = vec![sector_buf(1), sector_buf(1)];
    handle.read(0, &mut read).await.unwrap();
    assert_eq!(&read[0][..], &stamped_sector(0)[..]);
    assert_eq!(&read[1][..], &stamped_sector(1)[..]);
}

#[tokio::test]
async fn test_out_of_bounds_rejected_before_io() {
    let (_tmp, handle) = connect_sectors(16, true).await;

    let err = handle.write(16, &[stamped_sector(16)]).await.unwrap_err();
    assert!(matches!(err, BlockError::OutOfBounds { .. }), "{err:?}");

    let mut read = vec![sector_buf(2)];
    let err = handle.read(15, &mut read).await.unwrap_err();
    assert!(matches!(err, BlockError::OutOfBounds { .. }), "{err:?}");
}

#[tokio::test]
async fn test_read_only_handle_rejects_mutation() {
    let tmp = NamedTempFile::new().unwrap();
    tmp.as_file().set_len(16 * SECTOR_SIZE).unwrap();
    let handle = BlockHandle::connect(tmp.path(), false, Buffering::default())
        .await
        .unwrap();
    assert!(!handle.info().read_write);

    let err = handle.write(0, &[stamped_sector(0)]).await.unwrap_err();
    assert!(matches!(err, BlockError::ReadOnly), "{err:?}");
    let err = handle.discard(0, SECTOR_SIZE).await.unwrap_err();
    assert!(matches!(err, BlockError::ReadOnly), "{err:?}");

    // Reads still work.
    let mut read = vec![sector_buf(1)];
    handle.read(0, &mut read).await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_terminal_and_idempotent() {
    let (_tmp, handle) = connect_sectors(16, true).await;

    handle.disconnect().await;
    handle.disconnect().await;

    let err = handle.write(0, &[stamped_sector(0)]).await.unwrap_err();
    assert!(matches!(err, BlockError::Disconnected), "{err:?}");
    let mut read = vec![sector_buf(1)];
    let err = handle.read(0, &mut read).await.unwrap_err();
    assert!(matches!(err, BlockError::Disconnected), "{err:?}");
    let err = handle.discard(0, SECTOR_SIZE).await.unwrap_err();
    assert!(matches!(err, BlockError::Disconnected), "{err:?}");
    let err = handle.flush().await.unwrap_err();
    assert!(matches!(err, BlockError::Disconnected), "{err:?}");
}

#[tokio::test]
async fn test_more_callers_than_descriptors_all_complete() {
    let (_tmp, handle) = connect_sectors(256, true).await;
    let handle = Arc::new(handle);

    handle.write(0, &[stamped_sector(0)]).await.unwrap();

    // Three times the pool capacity; excess callers queue at acquire and
    // must all complete once earlier operations release their descriptor.
    let tasks: Vec<_> = (0..3 * (POOL_SIZE + 1))
        .map(|i| {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                if i % 2 == 0 {
                    let mut read = vec![sector_buf(1)];
                    handle.read(0, &mut read).await.unwrap();
                } else {
                    handle
                        .write(1 + (i as u64 % 200), &[stamped_sector(7)])
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_flush_succeeds() {
    let (_tmp, handle) = connect_sectors(16, true).await;
    handle.write(3, &[stamped_sector(3)]).await.unwrap();
    handle.flush().await.unwrap();
}

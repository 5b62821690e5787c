//! Integration tests for demand paging on the access-checked path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{cluster, config, pattern};
use memfabric::{FabricError, MemoryManager, NodeId, PageState, Region};

/// Move a paged region from node 0 to node 1 without pulling anything.
fn hand_over(a: &MemoryManager, b: &MemoryManager, size: usize, seed: u8) -> Result<(Arc<Region>, Vec<u8>)> {
    let region = a.allocate(size)?;
    let data = pattern(size, seed);
    a.write(region.base(), &data)?;
    a.migrate(&region, NodeId(1))?;
    let received = b.wait_for_transfer()?;
    assert_eq!(received.pages().unwrap().local_count(), 0);
    Ok((received, data))
}

#[test]
fn test_reads_fault_in_single_pages() -> Result<()> {
    let (fabric, nodes) = cluster(2, config().default_page_size(Some(512)));
    let (received, data) = hand_over(&nodes[0], &nodes[1], 4096, 1)?;
    let b = &nodes[1];
    let base = received.base();
    fabric.reset_counters();

    let mut byte = [0u8; 1];
    b.read(base.offset(2000), &mut byte)?;
    assert_eq!(byte[0], data[2000]);
    let states = received.pages().unwrap().states();
    assert_eq!(states.len(), 8);
    assert_eq!(states[3], PageState::Local);
    assert_eq!(received.pages().unwrap().local_count(), 1);

    b.read(base.offset(10), &mut byte)?;
    assert_eq!(byte[0], data[10]);
    let states = received.pages().unwrap().states();
    assert_eq!(states[0], PageState::Local);
    assert_eq!(states[3], PageState::Local);
    assert_eq!(received.pages().unwrap().local_count(), 2);
    assert_eq!(fabric.stats().reads_issued, 2);
    assert_eq!(fabric.reads_at(base.offset(3 * 512)), 1);

    // A read spanning pages 3 and 4 only pulls page 4.
    let mut span = [0u8; 100];
    b.read(base.offset(2000), &mut span)?;
    assert_eq!(&span[..], &data[2000..2100]);
    assert_eq!(fabric.stats().reads_issued, 3);
    Ok(())
}

#[test]
fn test_concurrent_faults_pull_each_page_once() -> Result<()> {
    let (fabric, nodes) = cluster(2, config().default_page_size(Some(1024)));
    let (received, data) = hand_over(&nodes[0], &nodes[1], 4096, 2)?;
    let b = &nodes[1];
    fabric.reset_counters();
    fabric.set_read_delay(Duration::from_millis(5));

    let target = received.base().offset(1500);
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let mut byte = [0u8; 1];
                b.read(target, &mut byte).unwrap();
                assert_eq!(byte[0], data[1500]);
            });
        }
    });

    assert_eq!(fabric.reads_at(received.base().offset(1024)), 1);
    assert_eq!(fabric.stats().reads_issued, 1);
    assert_eq!(received.pages().unwrap().local_count(), 1);
    Ok(())
}

#[test]
fn test_sync_and_async_bulk_pulls() -> Result<()> {
    let (fabric, nodes) = cluster(2, config().default_page_size(Some(1024)));
    let (received, data) = hand_over(&nodes[0], &nodes[1], 16 * 1024, 3)?;
    let b = &nodes[1];

    // First half in index order, second half with at most four reads in flight.
    let pulled = b.pull_pages_sync(received.base(), 8 * 1024, NodeId(0))?;
    assert_eq!(pulled, 8);
    fabric.set_read_delay(Duration::from_millis(1));
    let pulled = b.pull_pages_async(received.base().offset(8 * 1024), 8 * 1024, NodeId(0), 4)?;
    assert_eq!(pulled, 8);
    assert!(fabric.stats().peak_async_reads <= 4);
    assert!(received.is_resident());

    let mut buf = vec![0u8; data.len()];
    b.read(received.base(), &mut buf)?;
    assert_eq!(buf, data);
    assert_eq!(b.pull_all_pages(&received)?, 0);
    Ok(())
}

#[test]
fn test_failed_pull_surfaces_and_recovers() -> Result<()> {
    let (fabric, nodes) = cluster(2, config().default_page_size(Some(1024)));
    let (received, data) = hand_over(&nodes[0], &nodes[1], 4096, 4)?;
    let b = &nodes[1];

    fabric.set_fail_reads(true);
    let mut byte = [0u8; 1];
    let err = b.read(received.base(), &mut byte).unwrap_err();
    assert!(matches!(err, FabricError::PullFailed { .. }));
    assert_eq!(received.pages().unwrap().state_of(0), PageState::Remote);
    assert!(matches!(
        b.pull_all_pages(&received),
        Err(FabricError::PullFailed { .. })
    ));
    assert_eq!(received.outstanding_pulls(), 0);
    assert!(b.stats().pager.failed_pulls >= 2);

    fabric.set_fail_reads(false);
    b.read(received.base(), &mut byte)?;
    assert_eq!(byte[0], data[0]);
    Ok(())
}

#[test]
fn test_close_waits_for_every_page() -> Result<()> {
    let (_fabric, nodes) = cluster(2, config().default_page_size(Some(1024)));
    let (a, b) = (&nodes[0], &nodes[1]);
    let (received, data) = hand_over(a, b, 4096, 5)?;

    b.ensure_local(received.base().offset(10))?;
    assert!(matches!(
        b.close(&received),
        Err(FabricError::ProtocolViolation { .. })
    ));

    b.pull(&received)?;
    b.close(&received)?;
    a.wait_for_close(&received)?;
    b.wait_for_close(&received)?;

    let mut buf = vec![0u8; data.len()];
    b.read(received.base(), &mut buf)?;
    assert_eq!(buf, data);
    let stats = b.stats();
    assert_eq!(stats.pager.pages_pulled, 4);
    assert_eq!(stats.protocol.transfers_received, 1);
    Ok(())
}

#[test]
fn test_write_on_destination_pulls_first() -> Result<()> {
    let (_fabric, nodes) = cluster(2, config().default_page_size(Some(1024)));
    let (received, data) = hand_over(&nodes[0], &nodes[1], 2048, 6)?;
    let b = &nodes[1];

    b.write(received.base().offset(1000), b"xy")?;
    assert_eq!(received.pages().unwrap().state_of(0), PageState::Local);
    assert_eq!(received.pages().unwrap().state_of(1), PageState::Remote);

    b.pull_all_pages(&received)?;
    let mut buf = vec![0u8; 2048];
    b.read(received.base(), &mut buf)?;
    assert_eq!(&buf[1000..1002], b"xy");
    assert_eq!(buf[..1000], data[..1000]);
    assert_eq!(buf[1002..], data[1002..]);
    Ok(())
}

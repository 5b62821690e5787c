//! Migrate a paged region between two in-process nodes and page it in on
//! demand.
//!
//! Run with: `cargo run --example migrate_demo`
//! Set `RUST_LOG=memfabric=debug` to watch the handshake.

use anyhow::{Context, Result};
use memfabric::tracing_support::{init_tracing, TracingConfig};
use memfabric::{FabricConfig, LoopbackFabric, MemoryManager, NodeId, RegionAddress};

const REGION_SIZE: usize = 256 * 1024;
const PAGE_SIZE: usize = 4096;

fn main() -> Result<()> {
    init_tracing(TracingConfig::default())?;

    let config = FabricConfig::default()
        .address_space(RegionAddress(1 << 44), 64 << 20)
        .default_page_size(Some(PAGE_SIZE))
        .from_env()
        .context("reading MEMFABRIC_* overrides")?;

    let fabric = LoopbackFabric::with_nodes(&[NodeId(0), NodeId(1)]);
    let node = |id: NodeId| -> Result<MemoryManager> {
        Ok(MemoryManager::builder(fabric.endpoint(id), fabric.coordinator(id))
            .config(config.clone())
            .build()?)
    };
    let source = node(NodeId(0))?;
    let dest = node(NodeId(1))?;

    let region = source.allocate(REGION_SIZE)?;
    let data: Vec<u8> = (0..REGION_SIZE).map(|i| (i % 253) as u8).collect();
    source.write(region.base(), &data)?;
    println!("allocated {} bytes at {} on {}", REGION_SIZE, region.base(), source.local_node());

    source.migrate(&region, dest.local_node())?;
    let received = dest.wait_for_transfer()?;
    println!(
        "{} now owns {} ({} pages, none local)",
        dest.local_node(),
        received.base(),
        received.pages().map(|p| p.num_pages()).unwrap_or(0)
    );

    // Touch a few scattered bytes; each pulls in just its page.
    for offset in [0usize, 100_000, 200_000] {
        let mut byte = [0u8; 1];
        dest.read(received.base().offset(offset), &mut byte)?;
        anyhow::ensure!(byte[0] == data[offset], "byte {offset} differs");
    }
    println!(
        "after three reads: {} of {} pages local",
        received.pages().map(|p| p.local_count()).unwrap_or(0),
        received.pages().map(|p| p.num_pages()).unwrap_or(0)
    );

    let pulled = dest.pull(&received)?;
    dest.close(&received)?;
    source.wait_for_close(&region)?;
    dest.wait_for_close(&received)?;
    println!("pulled the remaining {pulled} pages and closed the transfer");

    let stats = dest.stats();
    println!(
        "destination: {} pages / {} bytes pulled, {} faults",
        stats.pager.pages_pulled, stats.pager.bytes_pulled, stats.pager.faults
    );
    println!("source regions left: {}", source.stats().registry.live_regions);
    Ok(())
}

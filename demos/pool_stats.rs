use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use usm_rs::RuntimeConfig;
use usm_rs::native::mock::MockDriver;
use usm_rs::native::{DeviceFamily, NativeDriver};
use usm_rs::runtime::{
    AllocInfoQuery, Platform, usm_device_alloc, usm_free, usm_get_mem_alloc_info, usm_host_alloc,
};
use usm_rs::usm::{PoolAllocator, UsmAllocDesc};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== USM Pool Statistics ===");

    // 1. A mock PVC card with two tiles
    let driver = MockDriver::builder().gpu(DeviceFamily::GpuPvc, 2).build();
    let config = RuntimeConfig::from_env().with_pool_trace(2);
    let platform = Platform::new(Arc::clone(&driver) as Arc<dyn NativeDriver>, config);
    let context = platform.create_context(platform.devices())?;
    let root = Arc::clone(&context.devices()[0]);
    println!("[+] Context {} over {} root device(s)", context.handle(), context.devices().len());

    // 2. Host allocations across several size classes
    let desc = UsmAllocDesc::default();
    let mut live = Vec::new();
    for size in [64, 64, 200, 4096, 64 * 1024, 3 * 1024 * 1024] {
        let ptr = usm_host_alloc(&context, &desc, None, size)?;
        println!("    host   {size:>8} bytes at 0x{ptr:x}");
        live.push(ptr);
    }

    // 3. Device allocations through each tile land in one allocator
    for tile in root.sub_devices() {
        let ptr = usm_device_alloc(&context, tile, &desc, None, 1024)?;
        let owner = usm_get_mem_alloc_info(&context, ptr, AllocInfoQuery::Device)?;
        println!("    device {:>8} bytes at 0x{ptr:x} via {} -> {owner:?}", 1024, tile.handle());
        live.push(ptr);
    }

    // 4. Host pool statistics
    let pool = context.default_pool()?;
    if let Some(allocation) = pool.find_allocation(live[0]) {
        if let PoolAllocator::Disjoint(host) = allocation.allocator.as_ref() {
            let stats = host.stats();
            println!(
                "[+] Host pool: {} allocs, {} slabs live, {} bypassed the slabs",
                stats.allocs, stats.live_slabs, stats.large_allocs
            );
            for (base, size, chunk) in host.slab_ranges() {
                println!("    slab 0x{base:x} size {size:>8} chunk {chunk:>6}");
            }
        }
    }

    // 5. Free everything and tear the context down
    for ptr in live {
        usm_free(&context, ptr)?;
    }
    drop(pool);
    context.release()?;

    let stats = driver.stats();
    println!(
        "[+] Driver saw {} allocs and {} frees, {} still live",
        stats.allocs,
        stats.frees,
        driver.live_allocations()
    );
    Ok(())
}

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use usm_rs::native::mock::MockDriver;
use usm_rs::native::{DeviceFamily, NativeDriver};
use usm_rs::runtime::Platform;
use usm_rs::sanitizer::{SanitizerInterceptor, SanitizerOptions};
use usm_rs::usm::UsmAllocDesc;
use usm_rs::{RuntimeConfig, UsmError};

fn print_shadow(label: &str, bytes: &[u8]) {
    let row: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
    println!("    {label:<10} {}", row.join(" "));
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Shadow Memory Poisoning ===");

    // 1. Sanitized platform over a mock DG2 card
    let driver = MockDriver::builder().gpu(DeviceFamily::GpuDg2, 0).build();
    let platform = Platform::new(Arc::clone(&driver) as Arc<dyn NativeDriver>, RuntimeConfig::from_env());
    let context = platform.create_context(platform.devices())?;
    let device = Arc::clone(&context.devices()[0]);
    let sanitizer = SanitizerInterceptor::new(Arc::clone(&platform), SanitizerOptions::from_env());

    // 2. A 13 byte device allocation between two redzones
    let ptr = sanitizer.device_alloc(&context, &device, &UsmAllocDesc::default(), None, 13)?;
    let info = sanitizer
        .find_alloc_info_by_address(ptr)
        .ok_or("allocation is not registered")?;
    println!(
        "[+] User 0x{ptr:x}, allocation 0x{:x}..0x{:x}",
        info.alloc_begin,
        info.alloc_end()
    );

    let shadow = sanitizer
        .shadow(context.handle(), DeviceFamily::GpuDg2)
        .ok_or("shadow was not created")?;
    let granules = info.alloc_size / 8;
    print_shadow("allocated", &shadow.read(info.alloc_begin, granules)?);

    // 3. Release and inspect the freed shadow
    sanitizer.release(&context, ptr)?;
    if sanitizer.quarantine().is_some() {
        print_shadow("freed", &shadow.read(info.alloc_begin, granules)?);
    }

    // 4. Misuse is reported, not ignored
    match sanitizer.release(&context, ptr) {
        Err(e @ (UsmError::BadFree { .. } | UsmError::DoubleFree { .. })) => println!("[+] {e}"),
        other => println!("[-] unexpected result: {other:?}"),
    }

    let stats = sanitizer.stats(context.handle());
    println!(
        "[+] {} bytes allocated ({} in redzones), {} freed",
        stats.usm_malloced, stats.usm_malloced_redzones, stats.usm_freed
    );

    // 5. Shadow pages go away with the context
    drop(shadow);
    sanitizer.remove_context_shadows(context.handle());
    context.release()?;
    println!("[+] {} shadow pages left mapped", driver.mapped_pages());
    Ok(())
}

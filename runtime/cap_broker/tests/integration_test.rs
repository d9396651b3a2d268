//! Integration tests for the capability broker
//!
//! These tests walk the resource acquisition a driver performs at probe
//! time, end to end through the software broker:
//! - Platform description parsing
//! - Register window mapping and release
//! - Interrupt line binding, dispatch and release

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use cap_broker::*;
use serde::Deserialize;

#[derive(Deserialize)]
struct Platform {
    #[serde(rename = "device")]
    devices: Vec<DeviceInfo>,
}

const PLATFORM: &str = r#"
[[device]]
name = "mbox@1e789200"
compatible = "aspeed,mbox-host"
reg = { base = 0x1e789200, size = 0x100 }
irq = 46

[[device]]
name = "lpc-ctrl@1e789000"
compatible = "aspeed,lpc-ctrl"
reg = { base = 0x1e789000, size = 0x100 }
memory_region = { base = 0x98000000, size = 0x1000000 }
"#;

fn broker_with_platform() -> (SoftBroker, Vec<DeviceInfo>) {
    let platform: Platform = toml::from_str(PLATFORM).expect("Failed to parse platform");
    let mut broker = SoftBroker::new();
    for device in &platform.devices {
        broker
            .add_device(device.clone(), Arc::new(RamWindow::new(device.reg.size)))
            .expect("Failed to add device");
    }
    (broker, platform.devices)
}

/// Test a probe-time workflow: map registers, bind the line, release both
#[test]
fn test_probe_workflow() {
    let (mut broker, devices) = broker_with_platform();
    let mbox = &devices[0];

    // 1. Map the register window
    let map = broker
        .map_registers(mbox)
        .expect("Failed to map registers");
    assert_eq!(map.device_name(), mbox.name);
    assert_eq!(map.region.paddr, mbox.reg.base);
    assert_eq!(map.region.vaddr & (PAGE_SIZE - 1), mbox.reg.base & (PAGE_SIZE - 1));

    // 2. Registers are live through the map
    map.window.write32(0x40, 0xdead_beef);
    assert_eq!(map.window.read8(0x40), 0xef);

    // 3. Bind the interrupt line
    let irq = broker.resolve_irq(mbox).expect("Device has no routable IRQ");
    assert_eq!(irq, 46);
    let hits = Arc::new(AtomicUsize::new(0));
    let handler = {
        let hits = hits.clone();
        Arc::new(move |_: u32| {
            hits.fetch_add(1, Ordering::SeqCst);
            IrqReturn::Handled
        })
    };
    let registration = broker
        .request_irq(irq, IrqFlags::SHARED, "mbox-host", handler)
        .expect("Failed to request IRQ");

    assert_eq!(broker.raise_irq(irq), IrqReturn::Handled);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // 4. Release in reverse order
    broker.free_irq(registration).expect("Failed to free IRQ");
    assert_eq!(broker.raise_irq(irq), IrqReturn::None);
    broker.unmap_registers(map).expect("Failed to unmap");
    assert!(!broker.is_mapped(&mbox.name));
}

/// Test that devices map to distinct windows and can be remapped
#[test]
fn test_multiple_devices() {
    let (mut broker, devices) = broker_with_platform();

    let first = broker.map_registers(&devices[0]).unwrap();
    let second = broker.map_registers(&devices[1]).unwrap();
    assert_ne!(first.region.vaddr, second.region.vaddr);
    assert!(matches!(
        broker.map_registers(&devices[0]),
        Err(CapabilityError::AlreadyMapped { .. })
    ));

    broker.unmap_registers(first).unwrap();
    let again = broker.map_registers(&devices[0]).unwrap();
    assert_eq!(again.device_name(), devices[0].name);

    broker.unmap_registers(again).unwrap();
    broker.unmap_registers(second).unwrap();
}

/// Test that devices without an interrupt line resolve to none
#[test]
fn test_device_without_irq() {
    let (broker, devices) = broker_with_platform();
    let lpc = &devices[1];

    assert!(broker.resolve_irq(lpc).is_none());
    assert_eq!(lpc.memory_region.map(|r| r.size), Some(0x100_0000));
}

/// Test interrupt delivery from another thread while handlers come and go
#[test]
fn test_concurrent_dispatch() {
    let (mut broker, devices) = broker_with_platform();
    let irq = broker.resolve_irq(&devices[0]).unwrap();
    let table = broker.irq_table();

    let hits = Arc::new(AtomicUsize::new(0));
    let handler = {
        let hits = hits.clone();
        Arc::new(move |_: u32| {
            hits.fetch_add(1, Ordering::SeqCst);
            IrqReturn::Handled
        })
    };
    let registration = broker
        .request_irq(irq, IrqFlags::SHARED, "mbox-host", handler)
        .unwrap();

    let raiser = thread::spawn(move || {
        for _ in 0..1000 {
            table.raise(irq);
        }
    });
    raiser.join().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1000);

    // After free returns the handler is never invoked again
    broker.free_irq(registration).unwrap();
    broker.raise_irq(irq);
    assert_eq!(hits.load(Ordering::SeqCst), 1000);
}

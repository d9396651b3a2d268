//! Integration tests for the LPC controller driver

use std::sync::Arc;

use cap_broker::{DeviceInfo, RamWindow, RegRange, RegisterWindow, SoftBroker};
use dddk_runtime::{Driver, DriverError, IoctlArg, MiscRegistry, Signals};
use kaal_drivers::lpc_ctrl::{
    LPC_CTRL_IOCTL_MAP, LPC_CTRL_IOCTL_SIZE, LPC_CTRL_IOCTL_UNMAP, LPC_HICR7, LPC_HICR8,
};
use kaal_drivers::{probe_device, BoundDriver, LpcCtrl, LpcMapping, MboxConfig};

const RESERVED_BASE: usize = 0x9800_0000;
const RESERVED_SIZE: usize = 0x0100_0000;

fn lpc_device(memory_region: Option<RegRange>) -> DeviceInfo {
    DeviceInfo {
        name: "lpc-ctrl@1e789080".into(),
        compatible: LpcCtrl::COMPATIBLE.into(),
        reg: RegRange {
            base: 0x1e78_9000,
            size: 0x100,
        },
        irq: None,
        memory_region,
    }
}

fn setup() -> (Arc<RamWindow>, SoftBroker, MiscRegistry, LpcCtrl) {
    let _ = env_logger::builder().is_test(true).try_init();

    let regs = Arc::new(RamWindow::new(0x100));
    let mut broker = SoftBroker::new();
    let device = lpc_device(Some(RegRange {
        base: RESERVED_BASE,
        size: RESERVED_SIZE,
    }));
    broker
        .add_device(device.clone(), regs.clone())
        .expect("Failed to add device");

    let misc = MiscRegistry::new();
    let lpc = LpcCtrl::probe(&mut broker, &misc, &device).expect("Failed to probe LPC controller");
    (regs, broker, misc, lpc)
}

/// The size query reports the reserved region
#[test]
fn test_size_query() {
    let (_regs, _broker, misc, _lpc) = setup();
    let file = misc.open(LpcCtrl::NAME).unwrap();

    let mut out = [0u8; 4];
    file.ioctl(LPC_CTRL_IOCTL_SIZE, IoctlArg::Out(&mut out))
        .unwrap();
    assert_eq!(u32::from_le_bytes(out), RESERVED_SIZE as u32);

    let mut short = [0u8; 2];
    assert!(matches!(
        file.ioctl(LPC_CTRL_IOCTL_SIZE, IoctlArg::Out(&mut short)),
        Err(DriverError::Fault(_))
    ));
}

/// Mapping programs the window registers; unmapping restores the defaults
#[test]
fn test_map_and_unmap_window() {
    let (regs, _broker, misc, _lpc) = setup();
    let file = misc.open(LpcCtrl::NAME).unwrap();

    let mapping = LpcMapping {
        hostaddr: 0x0fc0_0000,
        size: 0x0040_0000,
    };
    file.ioctl(LPC_CTRL_IOCTL_MAP, IoctlArg::In(&mapping.to_bytes()))
        .unwrap();
    assert_eq!(regs.read32(LPC_HICR7), 0x9800_0fc0);
    assert_eq!(regs.read32(LPC_HICR8), 0xffc0_003f);

    file.ioctl(LPC_CTRL_IOCTL_UNMAP, IoctlArg::Value(0)).unwrap();
    assert_eq!(regs.read32(LPC_HICR7), 0x3000_0e00);
    assert_eq!(regs.read32(LPC_HICR8), 0xfe00_01ff);
}

/// A misaligned mapping is rejected before any register is written
#[test]
fn test_misaligned_map_rejected() {
    let (regs, _broker, _misc, lpc) = setup();

    let mapping = LpcMapping {
        hostaddr: 0x0fc0_8000,
        size: 0x0040_0000,
    };
    assert!(matches!(
        lpc.endpoint().map_window(&mapping),
        Err(DriverError::InvalidArgument(_))
    ));
    assert_eq!(regs.read32(LPC_HICR7), 0);
    assert_eq!(regs.read32(LPC_HICR8), 0);
}

/// The endpoint has no byte stream
#[test]
fn test_read_write_not_supported() {
    let (_regs, _broker, misc, _lpc) = setup();
    let file = misc.open(LpcCtrl::NAME).unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(
        file.read(&mut buf, &Signals::new()),
        Err(DriverError::NotSupported)
    ));
    assert!(matches!(file.write(&buf), Err(DriverError::NotSupported)));
    assert!(matches!(
        file.ioctl(0xdead, IoctlArg::Value(0)),
        Err(DriverError::InvalidArgument(_))
    ));
}

/// Memory mappings must stay inside the reserved region
#[test]
fn test_mmap_bounds() {
    let (_regs, _broker, _misc, lpc) = setup();
    let endpoint = lpc.endpoint();

    let range = endpoint.mmap_range(0x1000, 0x2000).unwrap();
    assert_eq!(range.base, RESERVED_BASE + 0x1000);
    assert_eq!(range.size, 0x2000);

    assert!(endpoint.mmap_range(0, RESERVED_SIZE as u64).is_ok());
    assert!(endpoint.mmap_range(1, RESERVED_SIZE as u64).is_err());
    assert!(endpoint.mmap_range(0, 0).is_err());
    assert!(endpoint.mmap_range(u64::MAX, 2).is_err());
}

/// A device without a reserved region cannot be attached
#[test]
fn test_probe_without_reserved_memory() {
    let mut broker = SoftBroker::new();
    let device = lpc_device(None);
    broker
        .add_device(device.clone(), Arc::new(RamWindow::new(0x100)))
        .unwrap();
    let misc = MiscRegistry::new();

    assert!(matches!(
        LpcCtrl::probe(&mut broker, &misc, &device),
        Err(DriverError::ResourceUnavailable(_))
    ));
    assert!(!broker.is_mapped(&device.name));
    assert!(!misc.contains(LpcCtrl::NAME));
}

/// Generic probing picks the driver by compatible string
#[test]
fn test_probe_device_dispatch() {
    let mut broker = SoftBroker::new();
    let device = lpc_device(Some(RegRange {
        base: RESERVED_BASE,
        size: RESERVED_SIZE,
    }));
    broker
        .add_device(device.clone(), Arc::new(RamWindow::new(0x100)))
        .unwrap();
    let misc = MiscRegistry::new();

    let bound = probe_device(&mut broker, &misc, &device, MboxConfig::default())
        .unwrap()
        .expect("No driver bound");
    assert!(matches!(bound, BoundDriver::LpcCtrl(_)));
    assert_eq!(bound.name(), LpcCtrl::NAME);

    let unknown = DeviceInfo {
        compatible: "vendor,unknown".into(),
        ..device.clone()
    };
    assert!(probe_device(&mut broker, &misc, &unknown, MboxConfig::default())
        .unwrap()
        .is_none());

    bound.remove(&mut broker, &misc).unwrap();
    assert!(!broker.is_mapped(&device.name));
}

//! LPC host-window controller
//!
//! Companion to the mailbox: steers a window of the host's LPC firmware
//! space onto a reserved region of BMC memory, so bulk data can be exchanged
//! out of band while the mailbox carries the commands. The endpoint has no
//! byte stream; it is driven entirely by control codes, and the reserved
//! region itself is exposed by [`LpcCtrlEndpoint::mmap_range`].

use std::sync::Arc;

use cap_broker::{CapabilityBroker, DeviceInfo, RegRange, RegisterMap, RegisterWindow};
use dddk_runtime::{ioc, Driver, DriverError, FileOperations, IoctlArg, MiscRegistry, Result};
use log::{debug, info, warn};

/// Host-to-BMC window base register
pub const LPC_HICR7: usize = 0x88;
/// Host-to-BMC window mask register
pub const LPC_HICR8: usize = 0x8c;

/// Windows are placed and sized in 64 KiB units
const LPC_WINDOW_GRANULE: u32 = 0x1_0000;

const LPC_CTRL_IOCTL_MAGIC: u8 = 0xb2;

/// Report the reserved region size as a little-endian `u32`
pub const LPC_CTRL_IOCTL_SIZE: u32 = ioc::ior(LPC_CTRL_IOCTL_MAGIC, 0x00, core::mem::size_of::<u32>());
/// Map a host window; parameter block is an encoded [`LpcMapping`]
pub const LPC_CTRL_IOCTL_MAP: u32 = ioc::iow(LPC_CTRL_IOCTL_MAGIC, 0x01, LpcMapping::ENCODED_LEN);
/// Restore the reset-default window
pub const LPC_CTRL_IOCTL_UNMAP: u32 = ioc::io(LPC_CTRL_IOCTL_MAGIC, 0x02);

/// Reset-default window registers
const HICR7_DEFAULT: u32 = (0x3000 << 16) | 0x0e00;
const HICR8_DEFAULT: u32 = (!(0x0200u32 - 1) << 16) | (0x0200 - 1);

/// Parameter block of [`LPC_CTRL_IOCTL_MAP`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LpcMapping {
    /// Host LPC address the window starts at
    pub hostaddr: u32,
    /// Window length in bytes
    pub size: u32,
}

impl LpcMapping {
    pub const ENCODED_LEN: usize = 8;

    /// Decode from two little-endian words
    ///
    /// # Errors
    /// Returns `Fault` if `bytes` is shorter than [`Self::ENCODED_LEN`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let word = |at: usize| -> Result<u32> {
            bytes
                .get(at..at + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or_else(|| DriverError::Fault(format!("mapping block of {} bytes", bytes.len())))
        };
        Ok(Self {
            hostaddr: word(0)?,
            size: word(4)?,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.hostaddr.to_le_bytes());
        out[4..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    fn validate(&self) -> Result<()> {
        let granular = |v: u32| v != 0 && v % LPC_WINDOW_GRANULE == 0;
        if !granular(self.hostaddr) || !granular(self.size) {
            return Err(DriverError::InvalidArgument(format!(
                "window {:#x}+{:#x} is not a non-zero multiple of 64 KiB",
                self.hostaddr, self.size
            )));
        }
        Ok(())
    }
}

/// Consumer-facing side of the controller
pub struct LpcCtrlEndpoint {
    regs: Arc<dyn RegisterWindow>,
    mem_base: u32,
    mem_size: u32,
}

impl LpcCtrlEndpoint {
    /// Size of the reserved region
    pub fn window_size(&self) -> u32 {
        self.mem_size
    }

    /// Point the host window at the reserved region
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the address or size is not a non-zero
    /// multiple of 64 KiB; registers are untouched
    pub fn map_window(&self, mapping: &LpcMapping) -> Result<()> {
        mapping.validate()?;

        let hicr7 = self.mem_base | (mapping.hostaddr >> 16);
        let hicr8 = !(mapping.size - 1) | ((mapping.size >> 16) - 1);
        self.regs.write32(LPC_HICR7, hicr7);
        self.regs.write32(LPC_HICR8, hicr8);

        info!(
            "lpc-ctrl: host {:#x}+{:#x} -> {:#x} (HICR7={:#010x} HICR8={:#010x})",
            mapping.hostaddr, mapping.size, self.mem_base, hicr7, hicr8
        );
        Ok(())
    }

    /// Restore the reset-default window
    pub fn unmap_window(&self) {
        self.regs.write32(LPC_HICR7, HICR7_DEFAULT);
        self.regs.write32(LPC_HICR8, HICR8_DEFAULT);
        debug!("lpc-ctrl: window reset");
    }

    /// Physical range backing a mapping of `len` bytes at `offset` into the
    /// reserved region
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty range or one that runs past the
    /// region
    pub fn mmap_range(&self, offset: u64, len: u64) -> Result<RegRange> {
        let end = offset.checked_add(len);
        if len == 0 || end.map_or(true, |end| end > u64::from(self.mem_size)) {
            return Err(DriverError::InvalidArgument(format!(
                "range {offset:#x}+{len:#x} outside the {:#x}-byte region",
                self.mem_size
            )));
        }

        let to_usize = |v: u64| {
            usize::try_from(v).map_err(|_| DriverError::InvalidArgument(format!("{v:#x} too large")))
        };
        Ok(RegRange {
            base: self.mem_base as usize + to_usize(offset)?,
            size: to_usize(len)?,
        })
    }
}

impl FileOperations for LpcCtrlEndpoint {
    fn ioctl(&self, cmd: u32, arg: IoctlArg<'_>) -> Result<()> {
        match (cmd, arg) {
            (LPC_CTRL_IOCTL_SIZE, IoctlArg::Out(buf)) => {
                let out = buf
                    .get_mut(..4)
                    .ok_or_else(|| DriverError::Fault("size needs 4 bytes".into()))?;
                out.copy_from_slice(&self.mem_size.to_le_bytes());
                Ok(())
            }
            (LPC_CTRL_IOCTL_MAP, IoctlArg::In(block)) => {
                self.map_window(&LpcMapping::from_bytes(block)?)
            }
            (LPC_CTRL_IOCTL_UNMAP, _) => {
                self.unmap_window();
                Ok(())
            }
            (LPC_CTRL_IOCTL_SIZE | LPC_CTRL_IOCTL_MAP, _) => Err(DriverError::Fault(format!(
                "wrong parameter direction for {cmd:#x}"
            ))),
            _ => Err(DriverError::InvalidArgument(format!(
                "unknown control code {cmd:#x}"
            ))),
        }
    }
}

/// An attached LPC controller
pub struct LpcCtrl {
    endpoint: Arc<LpcCtrlEndpoint>,
    map: RegisterMap,
}

impl LpcCtrl {
    pub fn endpoint(&self) -> Arc<LpcCtrlEndpoint> {
        self.endpoint.clone()
    }
}

impl Driver for LpcCtrl {
    const NAME: &'static str = "lpc-ctrl";
    const COMPATIBLE: &'static str = "aspeed,lpc-ctrl";

    /// # Errors
    /// Returns `ResourceUnavailable` if the device has no reserved memory
    /// region, the region lies above 4 GiB, or the registers cannot be mapped
    fn probe(
        broker: &mut dyn CapabilityBroker,
        misc: &MiscRegistry,
        device: &DeviceInfo,
    ) -> Result<Self> {
        let region = device.memory_region.ok_or_else(|| {
            DriverError::ResourceUnavailable(format!("{}: no reserved memory region", device.name))
        })?;
        let narrow = |v: usize| {
            u32::try_from(v).map_err(|_| {
                DriverError::ResourceUnavailable(format!("{}: region {v:#x} above 4 GiB", device.name))
            })
        };
        let mem_base = narrow(region.base)?;
        let mem_size = narrow(region.size)?;

        let map = broker.map_registers(device)?;
        let endpoint = Arc::new(LpcCtrlEndpoint {
            regs: map.window.clone(),
            mem_base,
            mem_size,
        });

        if let Err(e) = misc.register(Self::NAME, endpoint.clone()) {
            broker.unmap_registers(map)?;
            return Err(e);
        }

        info!("{}: loaded at {:#x} ({:#x})", Self::NAME, mem_base, mem_size);
        Ok(Self { endpoint, map })
    }

    fn remove(self, broker: &mut dyn CapabilityBroker, misc: &MiscRegistry) -> Result<()> {
        if let Err(e) = misc.deregister(Self::NAME) {
            warn!("{}: endpoint already gone: {}", Self::NAME, e);
        }
        drop(self.endpoint);
        broker.unmap_registers(self.map)?;
        Ok(())
    }
}

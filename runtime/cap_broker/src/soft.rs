//! Software broker for hosts
//!
//! Serves devices whose registers are provided by the caller (usually a
//! hardware model) instead of physical memory. Interrupts are delivered by
//! calling [`SoftBroker::raise_irq`], or through the shared [`IrqTable`]
//! from another thread.

use std::collections::HashSet;
use std::sync::Arc;

use crate::irq::{IrqFlags, IrqHandler, IrqRegistration, IrqReturn, IrqTable};
use crate::mmio::{MmioMapper, RegisterWindow};
use crate::{CapabilityBroker, CapabilityError, DeviceInfo, RegisterMap, Result};

/// Virtual window the software broker hands addresses out of
const SOFT_MMIO_BASE: usize = 0x8000_0000;
const SOFT_MMIO_SIZE: usize = 256 * 1024 * 1024;

struct SoftDevice {
    info: DeviceInfo,
    window: Arc<dyn RegisterWindow>,
    mapped: bool,
}

/// Host-side implementation of [`CapabilityBroker`]
pub struct SoftBroker {
    devices: Vec<SoftDevice>,
    mapper: MmioMapper,
    irqs: Arc<IrqTable>,
    unroutable: HashSet<u32>,
}

impl SoftBroker {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            mapper: MmioMapper::new(SOFT_MMIO_BASE, SOFT_MMIO_SIZE),
            irqs: Arc::new(IrqTable::new()),
            unroutable: HashSet::new(),
        }
    }

    /// Register a device and the window that backs its registers
    ///
    /// # Errors
    /// Returns `InvalidRange` if the window is smaller than the described
    /// register range
    pub fn add_device(&mut self, info: DeviceInfo, window: Arc<dyn RegisterWindow>) -> Result<()> {
        if window.size() < info.reg.size {
            return Err(CapabilityError::InvalidRange {
                base: info.reg.base,
                size: info.reg.size,
            });
        }

        log::debug!("soft broker: {} ({}) at {:#x}", info.name, info.compatible, info.reg.base);
        self.devices.push(SoftDevice {
            info,
            window,
            mapped: false,
        });
        Ok(())
    }

    /// Make an interrupt line unroutable (or routable again)
    ///
    /// Devices whose line is unroutable resolve to no interrupt at all, the
    /// way a board without the interrupt wired up would.
    pub fn set_irq_routable(&mut self, irq: u32, routable: bool) {
        if routable {
            self.unroutable.remove(&irq);
        } else {
            self.unroutable.insert(irq);
        }
    }

    /// Deliver an interrupt
    pub fn raise_irq(&self, irq: u32) -> IrqReturn {
        self.irqs.raise(irq)
    }

    /// The interrupt table, for delivering interrupts from other threads
    pub fn irq_table(&self) -> Arc<IrqTable> {
        self.irqs.clone()
    }

    /// Whether a device's registers are currently mapped
    pub fn is_mapped(&self, name: &str) -> bool {
        self.devices.iter().any(|d| d.info.name == name && d.mapped)
    }

    /// Devices known to this broker
    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.iter().map(|d| &d.info)
    }

    fn find_mut(&mut self, name: &str) -> Result<&mut SoftDevice> {
        self.devices
            .iter_mut()
            .find(|d| d.info.name == name)
            .ok_or_else(|| CapabilityError::DeviceNotFound { name: name.into() })
    }
}

impl Default for SoftBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityBroker for SoftBroker {
    fn map_registers(&mut self, device: &DeviceInfo) -> Result<RegisterMap> {
        let (base, size, window) = {
            let entry = self.find_mut(&device.name)?;
            if entry.mapped {
                return Err(CapabilityError::AlreadyMapped {
                    name: device.name.clone(),
                });
            }
            (entry.info.reg.base, entry.info.reg.size, entry.window.clone())
        };

        let region = self.mapper.map_region(base, size)?;
        self.find_mut(&device.name)?.mapped = true;

        Ok(RegisterMap::new(device.name.clone(), region, window))
    }

    fn unmap_registers(&mut self, map: RegisterMap) -> Result<()> {
        self.mapper.unmap_region(&map.region)?;
        self.find_mut(map.device_name())?.mapped = false;
        Ok(())
    }

    fn resolve_irq(&self, device: &DeviceInfo) -> Option<u32> {
        device.irq.filter(|irq| !self.unroutable.contains(irq))
    }

    fn request_irq(
        &mut self,
        irq: u32,
        flags: IrqFlags,
        name: &str,
        handler: Arc<dyn IrqHandler>,
    ) -> Result<IrqRegistration> {
        if self.unroutable.contains(&irq) {
            return Err(CapabilityError::IrqUnroutable { irq });
        }
        self.irqs.request(irq, flags, name, handler)
    }

    fn free_irq(&mut self, registration: IrqRegistration) -> Result<()> {
        self.irqs.free(registration)
    }
}

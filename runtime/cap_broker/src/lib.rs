//! Capability Broker - Device resource acquisition for KaaL drivers
//!
//! # Purpose
//! The Capability Broker hides how a platform hands out device resources.
//! A driver describes the device it wants (a [`DeviceInfo`] taken from the
//! platform description) and receives back a mapped register window and,
//! where the platform can route it, an interrupt line binding.
//!
//! # Integration Points
//! - Depends on: platform description (device tree / TOML board file)
//! - Provides to: All driver components (`kaal-drivers`)
//! - Resources handed out: register windows, interrupt line registrations
//!
//! # Architecture
//! - [`mmio`]: the Register Access Layer. [`RegisterWindow`] is the raw 8-bit
//!   and 32-bit accessor; [`MmioRegion`] backs it with real device memory,
//!   [`RamWindow`] with plain memory for host simulation.
//! - [`irq`]: interrupt line table with shared-line handler chains.
//! - [`soft`]: a software broker that serves simulated devices on a host.
//!
//! # Testing Strategy
//! - Unit tests: page arithmetic, VA accounting, handler chains
//! - Integration tests: probe-style resource acquisition through [`SoftBroker`]

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

mod irq;
mod mmio;
mod soft;

pub use irq::{IrqFlags, IrqHandler, IrqRegistration, IrqReturn, IrqTable};
pub use mmio::{
    align_down, align_up, is_aligned, pages_needed, MappedRegion, MmioMapper, MmioRegion,
    RamWindow, RegisterWindow, PAGE_SIZE,
};
pub use soft::SoftBroker;

/// Error types for resource acquisition
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Device not found: {name}")]
    DeviceNotFound { name: String },

    #[error("Device {name} is already mapped")]
    AlreadyMapped { name: String },

    #[error("Out of virtual address space (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("Invalid register range {base:#x}+{size:#x}")]
    InvalidRange { base: usize, size: usize },

    #[error("IRQ {irq} already allocated")]
    IrqBusy { irq: u32 },

    #[error("IRQ {irq} cannot be routed on this platform")]
    IrqUnroutable { irq: u32 },

    #[error("IRQ {irq} has no handler registered as {name}")]
    IrqNotRegistered { irq: u32, name: String },
}

pub type Result<T> = core::result::Result<T, CapabilityError>;

/// A physical address range taken from the platform description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RegRange {
    /// Physical base address
    pub base: usize,

    /// Size in bytes
    pub size: usize,
}

impl RegRange {
    /// One past the last byte of the range
    pub fn end(&self) -> usize {
        self.base + self.size
    }
}

/// Static description of one platform device
///
/// This is everything a driver may consume from the platform: where the
/// registers live, the interrupt line (if the platform wired one up), and an
/// optional reserved memory region.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceInfo {
    /// Instance name, unique per platform
    pub name: String,

    /// Driver match key, e.g. `"aspeed,mbox-host"`
    pub compatible: String,

    /// Register window
    pub reg: RegRange,

    /// Interrupt line, when the platform routes one
    #[serde(default)]
    pub irq: Option<u32>,

    /// Reserved memory region referenced by the device
    #[serde(default)]
    pub memory_region: Option<RegRange>,
}

/// A device's register window, mapped and ready for access
///
/// The window is shared by reference-counted handle so interrupt handlers and
/// timer callbacks can reach the same registers as the consumer side. The
/// broker only reclaims the mapping once the map itself is handed back through
/// [`CapabilityBroker::unmap_registers`].
pub struct RegisterMap {
    /// Where the region was mapped
    pub region: MappedRegion,

    /// Accessor for the mapped registers
    pub window: Arc<dyn RegisterWindow>,

    name: String,
}

impl RegisterMap {
    pub fn new(name: impl Into<String>, region: MappedRegion, window: Arc<dyn RegisterWindow>) -> Self {
        Self {
            region,
            window,
            name: name.into(),
        }
    }

    /// Name of the device this map belongs to
    pub fn device_name(&self) -> &str {
        &self.name
    }
}

impl core::fmt::Debug for RegisterMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisterMap")
            .field("device", &self.name)
            .field("region", &self.region)
            .finish()
    }
}

/// Main Capability Broker interface
pub trait CapabilityBroker {
    /// Map the register window of a device
    ///
    /// # Errors
    /// Returns error if the device is unknown, already mapped, or the
    /// address space is exhausted
    fn map_registers(&mut self, device: &DeviceInfo) -> Result<RegisterMap>;

    /// Release a register window obtained from [`map_registers`]
    ///
    /// [`map_registers`]: CapabilityBroker::map_registers
    fn unmap_registers(&mut self, map: RegisterMap) -> Result<()>;

    /// Resolve the interrupt line of a device
    ///
    /// Returns `None` when the description carries no interrupt or the
    /// platform cannot route it.
    fn resolve_irq(&self, device: &DeviceInfo) -> Option<u32>;

    /// Bind a handler to an interrupt line
    ///
    /// # Errors
    /// Returns error if the line is held exclusively by another handler or
    /// cannot be routed
    fn request_irq(
        &mut self,
        irq: u32,
        flags: IrqFlags,
        name: &str,
        handler: Arc<dyn IrqHandler>,
    ) -> Result<IrqRegistration>;

    /// Unbind a handler
    ///
    /// On return the handler is no longer running and will not be invoked
    /// again.
    fn free_irq(&mut self, registration: IrqRegistration) -> Result<()>;
}

//! KaaL Drivers - Host/BMC communication drivers
//!
//! # Purpose
//! Drivers for the host side of the host/BMC link: the register mailbox that
//! carries short command frames, and the LPC controller that maps a shared
//! memory window for bulk data.
//!
//! # Integration Points
//! - Depends on: Capability Broker, DDDK runtime
//! - Provides to: consumers through the [`MiscRegistry`] endpoints
//!   `mbox-host` and `lpc-ctrl`
//!
//! # Architecture
//! - [`mbox_host`]: mailbox driver
//! - [`lpc_ctrl`]: LPC host-window controller
//! - [`sim`]: register-level controller model for hosts
//!
//! [`probe_device`] binds whichever driver matches a platform device.
//!
//! # Testing Strategy
//! - Unit tests: per module
//! - Integration tests: `tests/` drive attached drivers against [`sim`]
//! - Benchmarks: `benches/frame_path.rs`

pub mod lpc_ctrl;
pub mod mbox_host;
pub mod sim;

use cap_broker::{CapabilityBroker, DeviceInfo};
use dddk_runtime::{Driver, MiscRegistry, Result};

pub use lpc_ctrl::{LpcCtrl, LpcCtrlEndpoint, LpcMapping};
pub use mbox_host::{MboxConfig, MboxEndpoint, MboxHost, NotificationSource};
pub use sim::SimMailbox;

/// A driver bound to a device
pub enum BoundDriver {
    MboxHost(MboxHost),
    LpcCtrl(LpcCtrl),
}

impl BoundDriver {
    pub fn name(&self) -> &'static str {
        match self {
            BoundDriver::MboxHost(_) => MboxHost::NAME,
            BoundDriver::LpcCtrl(_) => LpcCtrl::NAME,
        }
    }

    /// Detach the driver
    pub fn remove(self, broker: &mut dyn CapabilityBroker, misc: &MiscRegistry) -> Result<()> {
        match self {
            BoundDriver::MboxHost(driver) => driver.remove(broker, misc),
            BoundDriver::LpcCtrl(driver) => driver.remove(broker, misc),
        }
    }
}

/// Probe the driver matching `device`
///
/// Returns `Ok(None)` if no driver handles the device.
///
/// # Arguments
/// * `mbox` - Tuning applied if the device is a mailbox
pub fn probe_device(
    broker: &mut dyn CapabilityBroker,
    misc: &MiscRegistry,
    device: &DeviceInfo,
    mbox: MboxConfig,
) -> Result<Option<BoundDriver>> {
    if MboxHost::matches(device) {
        return MboxHost::attach(broker, misc, device, mbox).map(|d| Some(BoundDriver::MboxHost(d)));
    }
    if LpcCtrl::matches(device) {
        return LpcCtrl::probe(broker, misc, device).map(|d| Some(BoundDriver::LpcCtrl(d)));
    }

    log::debug!("no driver for {} ({})", device.name, device.compatible);
    Ok(None)
}

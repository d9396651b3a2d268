//! Host mailbox driver
//!
//! # Purpose
//! Byte channel between the host CPU and the board management controller
//! over a bank of shared 8-bit registers. Each direction carries fixed-size
//! frames of [`MBOX_NUM_DATA_REGS`] bytes; a separate attention byte can be
//! posted at any time.
//!
//! # Integration Points
//! - Depends on: Capability Broker (register window, interrupt line)
//! - Provides to: consumers through the `mbox-host` endpoint in the
//!   [`MiscRegistry`]
//! - Notifications: interrupt line when the platform routes one, otherwise a
//!   poll timer
//!
//! # Architecture
//! - `regs`: register offsets and `MBOX_BMC_CTRL` bits
//! - `endpoint`: [`MboxEndpoint`], the read/write/signal/poll surface
//! - `source`: [`NotificationSource`] and the interrupt handler
//!
//! Handshake for inbound frames:
//! 1. Peer fills the payload slots and sets RECV
//! 2. Interrupt handler sets MASK and wakes readers (timer path: readers
//!    wake on the next tick)
//! 3. Reader copies the slots and writes RECV, which clears RECV and MASK
//!
//! # Testing Strategy
//! - Unit tests: handler decisions and endpoint edge cases on plain memory
//! - Integration tests: full attach/transfer/detach against the simulated
//!   controller in [`crate::sim`]

mod endpoint;
pub mod regs;
mod source;

use std::sync::Arc;
use std::time::Duration;

use cap_broker::{CapabilityBroker, DeviceInfo, IrqFlags, RegisterMap, RegisterWindow};
use dddk_runtime::{Driver, DriverError, MiscRegistry, Result, WaitQueue};
use log::{debug, error, info, warn};
use serde::Deserialize;

pub use endpoint::{MboxEndpoint, MBOX_HOST_IOCTL_ATN};
pub use regs::{CtrlBits, MBOX_NUM_DATA_REGS};
pub use source::NotificationSource;

use regs::{MBOX_BMC_CTRL, MBOX_INTERRUPT_0, MBOX_INTERRUPT_1, MBOX_STATUS_0, MBOX_STATUS_1};
use source::MboxIrq;

/// Attach-time tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MboxConfig {
    /// Delay before the first poll when no interrupt is available
    pub poll_initial_delay_ms: u64,

    /// Poll period after the first poll
    pub poll_period_ms: u64,
}

impl MboxConfig {
    pub fn poll_initial_delay(&self) -> Duration {
        Duration::from_millis(self.poll_initial_delay_ms)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    /// Check the tuning before any resource is acquired
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a zero poll period
    pub fn validate(&self) -> Result<()> {
        if self.poll_period_ms == 0 {
            return Err(DriverError::InvalidArgument(
                "poll_period_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for MboxConfig {
    fn default() -> Self {
        Self {
            poll_initial_delay_ms: 10,
            poll_period_ms: 500,
        }
    }
}

/// An attached mailbox
pub struct MboxHost {
    endpoint: Arc<MboxEndpoint>,
    source: NotificationSource,
    map: RegisterMap,
}

impl MboxHost {
    /// Attach with explicit tuning
    ///
    /// Maps the registers, publishes the endpoint, then binds the interrupt
    /// line. If the line cannot be had the driver falls back to polling;
    /// only a failure to arm the poll timer fails the attach.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `config` is unusable, and
    /// `ResourceUnavailable` if the registers cannot be mapped, the endpoint
    /// name is taken, or the poll timer cannot be armed. Everything acquired
    /// before the failure is released.
    pub fn attach(
        broker: &mut dyn CapabilityBroker,
        misc: &MiscRegistry,
        device: &DeviceInfo,
        config: MboxConfig,
    ) -> Result<Self> {
        info!("{}: found {} at {:#x}", Self::NAME, device.name, device.reg.base);
        config.validate()?;

        let map = broker.map_registers(device)?;
        let queue = Arc::new(WaitQueue::new());
        let endpoint = Arc::new(MboxEndpoint::new(map.window.clone(), queue.clone()));

        if let Err(e) = misc.register(Self::NAME, endpoint.clone()) {
            error!("{}: unable to register endpoint: {}", Self::NAME, e);
            Self::release_registers(broker, map);
            return Err(e);
        }

        let source = match Self::bind_irq(broker, device, &map.window, &queue) {
            Some(source) => source,
            None => {
                info!(
                    "{}: no interrupt, polling every {:?}",
                    Self::NAME,
                    config.poll_period()
                );
                match NotificationSource::timer(
                    config.poll_initial_delay(),
                    config.poll_period(),
                    queue,
                ) {
                    Ok(source) => source,
                    Err(e) => {
                        error!("{}: unable to arm poll timer: {}", Self::NAME, e);
                        if let Err(gone) = misc.deregister(Self::NAME) {
                            warn!("{}: endpoint already gone: {}", Self::NAME, gone);
                        }
                        endpoint.detach();
                        Self::release_registers(broker, map);
                        return Err(e);
                    }
                }
            }
        };

        info!("{}: attached ({:?})", Self::NAME, source);
        Ok(Self {
            endpoint,
            source,
            map,
        })
    }

    /// Try the interrupt path
    ///
    /// On success the controller's stale status is cleared and its
    /// interrupts enabled.
    fn bind_irq(
        broker: &mut dyn CapabilityBroker,
        device: &DeviceInfo,
        regs: &Arc<dyn RegisterWindow>,
        queue: &Arc<WaitQueue>,
    ) -> Option<NotificationSource> {
        let irq = broker.resolve_irq(device)?;

        let handler = Arc::new(MboxIrq::new(regs.clone(), queue.clone()));
        let registration = match broker.request_irq(irq, IrqFlags::SHARED, Self::NAME, handler) {
            Ok(registration) => registration,
            Err(e) => {
                warn!("{}: unable to request irq {}: {}", Self::NAME, irq, e);
                return None;
            }
        };

        regs.write8(MBOX_INTERRUPT_0, 0);
        regs.write8(MBOX_INTERRUPT_1, 0);
        // Status registers are write-one-to-clear
        regs.write8(MBOX_STATUS_0, 0xff);
        regs.write8(MBOX_STATUS_1, 0xff);
        regs.write8(MBOX_BMC_CTRL, CtrlBits::RECV.bits());

        debug!("{}: using irq {}", Self::NAME, irq);
        Some(NotificationSource::Interrupt(registration))
    }

    /// Unmap on an error path, where the first error is the one to report
    fn release_registers(broker: &mut dyn CapabilityBroker, map: RegisterMap) {
        let device = map.device_name().to_owned();
        if let Err(e) = broker.unmap_registers(map) {
            error!("{}: unable to unmap {}: {}", Self::NAME, device, e);
        }
    }

    /// Handle on the consumer endpoint
    pub fn endpoint(&self) -> Arc<MboxEndpoint> {
        self.endpoint.clone()
    }

    pub fn source(&self) -> &NotificationSource {
        &self.source
    }

    pub fn irq(&self) -> Option<u32> {
        self.source.irq()
    }

    /// Name of the device the driver is attached to
    pub fn device_name(&self) -> &str {
        self.map.device_name()
    }
}

impl Driver for MboxHost {
    const NAME: &'static str = "mbox-host";
    const COMPATIBLE: &'static str = "aspeed,mbox-host";

    fn probe(
        broker: &mut dyn CapabilityBroker,
        misc: &MiscRegistry,
        device: &DeviceInfo,
    ) -> Result<Self> {
        Self::attach(broker, misc, device, MboxConfig::default())
    }

    /// Detach
    ///
    /// The endpoint is withdrawn first so no new consumer can open it, and
    /// cut off from the registers so handles opened earlier fail with
    /// `ResourceUnavailable`; blocked readers are woken to see it. Then the
    /// notification source is stopped, and only then are the registers
    /// unmapped. The registers are unmapped even if stopping the source
    /// fails.
    fn remove(self, broker: &mut dyn CapabilityBroker, misc: &MiscRegistry) -> Result<()> {
        let MboxHost {
            endpoint,
            source,
            map,
        } = self;

        if let Err(e) = misc.deregister(Self::NAME) {
            warn!("{}: endpoint already gone: {}", Self::NAME, e);
        }
        endpoint.detach();

        let quiesced = source.quiesce(broker);
        if let Err(e) = &quiesced {
            error!("{}: unable to stop notifications: {}", Self::NAME, e);
        }

        let device = map.device_name().to_owned();
        broker.unmap_registers(map)?;
        quiesced?;
        info!("{}: detached from {}", Self::NAME, device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MboxConfig::default();
        assert_eq!(config.poll_initial_delay(), Duration::from_millis(10));
        assert_eq!(config.poll_period(), Duration::from_millis(500));
    }

    #[test]
    fn test_config_rejects_zero_period() {
        let config: MboxConfig = toml::from_str("poll_period_ms = 0").unwrap();
        assert!(matches!(
            config.validate(),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(MboxConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_partial_toml() {
        let config: MboxConfig = toml::from_str("poll_period_ms = 250").unwrap();
        assert_eq!(config.poll_initial_delay_ms, 10);
        assert_eq!(config.poll_period_ms, 250);
    }
}

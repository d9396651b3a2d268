//! DDDK Runtime - Runtime support for device driver development
//!
//! This crate provides the runtime types and traits shared by every KaaL
//! driver component: the error taxonomy, the driver lifecycle trait, the
//! wait/notify primitive drivers block consumers on, a periodic poll timer
//! for devices without a usable interrupt, and the character-device surface
//! drivers expose to consumers.

use thiserror::Error;

pub mod chardev;
pub mod timer;
pub mod wait;

pub use cap_broker::{CapabilityBroker, CapabilityError, DeviceInfo};
pub use chardev::{ioc, FileOperations, IoctlArg, MiscRegistry, OpenFile, PollMask};
pub use timer::PollTimer;
pub use wait::{PollTable, Signals, WaitQueue};

/// Driver error types
///
/// No operation retries internally; every failure is surfaced and the caller
/// owns the retry policy.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Bad argument or unknown control code. No state was changed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller buffer cannot hold or provide the transfer. No state was changed.
    #[error("Bad buffer: {0}")]
    Fault(String),

    /// A blocking wait was aborted by a signal. Hardware state is untouched
    /// and the call is safe to restart.
    #[error("Interrupted by signal")]
    Interrupted,

    /// Attach-time resource acquisition failed
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The endpoint has no such operation
    #[error("Operation not supported")]
    NotSupported,
}

impl DriverError {
    /// Conventional negative errno for character-device callers
    pub fn errno(&self) -> i32 {
        match self {
            DriverError::InvalidArgument(_) => -22, // EINVAL
            DriverError::Fault(_) => -14, // EFAULT
            DriverError::Interrupted => -512, // ERESTARTSYS
            DriverError::ResourceUnavailable(_) => -19, // ENODEV
            DriverError::NotSupported => -38, // ENOSYS
        }
    }
}

impl From<CapabilityError> for DriverError {
    fn from(err: CapabilityError) -> Self {
        DriverError::ResourceUnavailable(err.to_string())
    }
}

pub type Result<T> = core::result::Result<T, DriverError>;

/// Trait for driver lifecycle
pub trait Driver: Sized {
    /// Driver name, also the name its endpoint is registered under
    const NAME: &'static str;

    /// Device match key from the platform description
    const COMPATIBLE: &'static str;

    /// Probe and attach the driver to a device
    ///
    /// # Errors
    /// Returns `ResourceUnavailable` if the device's resources cannot be
    /// acquired; no partial state survives a failed probe
    fn probe(
        broker: &mut dyn CapabilityBroker,
        misc: &MiscRegistry,
        device: &DeviceInfo,
    ) -> Result<Self>;

    /// Detach from the device and release its resources
    fn remove(self, broker: &mut dyn CapabilityBroker, misc: &MiscRegistry) -> Result<()>;

    /// Whether this driver handles a device
    fn matches(device: &DeviceInfo) -> bool {
        device.compatible == Self::COMPATIBLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(DriverError::InvalidArgument("cmd".into()).errno(), -22);
        assert_eq!(DriverError::Fault("buf".into()).errno(), -14);
        assert_eq!(DriverError::Interrupted.errno(), -512);
        assert_eq!(DriverError::NotSupported.errno(), -38);
    }

    #[test]
    fn test_capability_error_is_resource_unavailable() {
        let err: DriverError = CapabilityError::IrqBusy { irq: 3 }.into();
        assert!(matches!(err, DriverError::ResourceUnavailable(ref msg) if msg.contains("IRQ 3")));
    }
}

//! Character-device surface of a driver
//!
//! Drivers expose consumers a byte-stream endpoint through
//! [`FileOperations`], registered by name in a [`MiscRegistry`]. Opening a
//! name yields an [`OpenFile`] handle; dropping the handle releases it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;

use crate::wait::{PollTable, Signals};
use crate::{DriverError, Result};

bitflags! {
    /// Readiness reported by [`FileOperations::poll`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollMask: u32 {
        /// A read would not block
        const IN = 0x0001;
        /// A write would not block
        const OUT = 0x0004;
        /// The device failed; always reported
        const ERR = 0x0008;
        /// The device has gone away; always reported
        const HUP = 0x0010;
    }
}

/// Argument of a control operation
#[derive(Debug)]
pub enum IoctlArg<'a> {
    /// Plain integer parameter
    Value(u64),

    /// Parameter block the driver reads from
    In(&'a [u8]),

    /// Parameter block the driver writes into
    Out(&'a mut [u8]),
}

impl IoctlArg<'_> {
    /// The integer parameter, if this is one
    pub fn value(&self) -> Result<u64> {
        match self {
            IoctlArg::Value(v) => Ok(*v),
            _ => Err(DriverError::InvalidArgument("expected an integer parameter".into())),
        }
    }
}

/// Linux-compatible control code encoding
pub mod ioc {
    const NRBITS: u32 = 8;
    const TYPEBITS: u32 = 8;
    const SIZEBITS: u32 = 14;

    const NRSHIFT: u32 = 0;
    const TYPESHIFT: u32 = NRSHIFT + NRBITS;
    const SIZESHIFT: u32 = TYPESHIFT + TYPEBITS;
    const DIRSHIFT: u32 = SIZESHIFT + SIZEBITS;

    pub const NONE: u32 = 0;
    pub const WRITE: u32 = 1;
    pub const READ: u32 = 2;

    pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
        (dir << DIRSHIFT) | ((ty as u32) << TYPESHIFT) | ((nr as u32) << NRSHIFT) | ((size as u32) << SIZESHIFT)
    }

    /// `_IO`
    pub const fn io(ty: u8, nr: u8) -> u32 {
        ioc(NONE, ty, nr, 0)
    }

    /// `_IOR`
    pub const fn ior(ty: u8, nr: u8, size: usize) -> u32 {
        ioc(READ, ty, nr, size)
    }

    /// `_IOW`
    pub const fn iow(ty: u8, nr: u8, size: usize) -> u32 {
        ioc(WRITE, ty, nr, size)
    }
}

/// Operations a driver endpoint supports
///
/// Every method has the behaviour of an endpoint without that operation, so
/// a driver implements only what its device does.
pub trait FileOperations: Send + Sync {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Read into `buf`, blocking as the endpoint requires
    ///
    /// `signals` belongs to the calling context; a raised signal aborts a
    /// blocking read with `Interrupted`.
    fn read(&self, _buf: &mut [u8], _signals: &Signals) -> Result<usize> {
        Err(DriverError::NotSupported)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(DriverError::NotSupported)
    }

    fn ioctl(&self, cmd: u32, _arg: IoctlArg<'_>) -> Result<()> {
        Err(DriverError::InvalidArgument(format!("unknown control code {cmd:#x}")))
    }

    /// Register with the endpoint's wait queue, then report readiness
    fn poll(&self, _table: &PollTable) -> PollMask {
        PollMask::empty()
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Named registry of driver endpoints
pub struct MiscRegistry {
    devices: Mutex<HashMap<String, Arc<dyn FileOperations>>>,
}

impl MiscRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn FileOperations>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an endpoint under `name`
    ///
    /// # Errors
    /// Returns `ResourceUnavailable` if the name is taken
    pub fn register(&self, name: &str, ops: Arc<dyn FileOperations>) -> Result<()> {
        let mut devices = self.lock();
        if devices.contains_key(name) {
            return Err(DriverError::ResourceUnavailable(format!(
                "endpoint {name} already registered"
            )));
        }
        devices.insert(name.into(), ops);
        log::debug!("misc: registered {}", name);
        Ok(())
    }

    /// Withdraw an endpoint; handles already open stay usable
    pub fn deregister(&self, name: &str) -> Result<()> {
        match self.lock().remove(name) {
            Some(_) => {
                log::debug!("misc: deregistered {}", name);
                Ok(())
            }
            None => Err(DriverError::ResourceUnavailable(format!("no endpoint named {name}"))),
        }
    }

    /// Open an endpoint by name
    pub fn open(&self, name: &str) -> Result<OpenFile> {
        let ops = self
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::ResourceUnavailable(format!("no endpoint named {name}")))?;
        ops.open()?;
        Ok(OpenFile { ops })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }
}

impl Default for MiscRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// An open endpoint handle
pub struct OpenFile {
    ops: Arc<dyn FileOperations>,
}

impl OpenFile {
    pub fn read(&self, buf: &mut [u8], signals: &Signals) -> Result<usize> {
        self.ops.read(buf, signals)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ops.write(buf)
    }

    pub fn ioctl(&self, cmd: u32, arg: IoctlArg<'_>) -> Result<()> {
        self.ops.ioctl(cmd, arg)
    }

    pub fn poll(&self, table: &PollTable) -> PollMask {
        self.ops.poll(table)
    }

    /// Block until the endpoint reports any of `events`
    ///
    /// `ERR` and `HUP` end the wait whether or not they were asked for.
    ///
    /// # Errors
    /// Returns `Interrupted` if `signals` is raised first
    pub fn wait_for(&self, events: PollMask, signals: &Signals) -> Result<PollMask> {
        let events = events | PollMask::ERR | PollMask::HUP;
        loop {
            let table = PollTable::new();
            let mask = self.poll(&table);
            if mask.intersects(events) {
                return Ok(mask);
            }
            table.wait(signals)?;
        }
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        if let Err(e) = self.ops.release() {
            log::warn!("release failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullEndpoint;

    impl FileOperations for NullEndpoint {}

    #[test]
    fn test_default_operations() {
        let misc = MiscRegistry::new();
        misc.register("null", Arc::new(NullEndpoint)).unwrap();

        let file = misc.open("null").unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            file.read(&mut buf, &Signals::new()),
            Err(DriverError::NotSupported)
        ));
        assert!(matches!(file.write(&buf), Err(DriverError::NotSupported)));
        assert!(matches!(
            file.ioctl(0x1234, IoctlArg::Value(0)),
            Err(DriverError::InvalidArgument(_))
        ));
        assert_eq!(file.poll(&PollTable::new()), PollMask::empty());
    }

    #[test]
    fn test_duplicate_registration() {
        let misc = MiscRegistry::new();
        misc.register("mbox-host", Arc::new(NullEndpoint)).unwrap();
        assert!(matches!(
            misc.register("mbox-host", Arc::new(NullEndpoint)),
            Err(DriverError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn test_open_after_deregister() {
        let misc = MiscRegistry::new();
        misc.register("mbox-host", Arc::new(NullEndpoint)).unwrap();
        let held = misc.open("mbox-host").unwrap();

        misc.deregister("mbox-host").unwrap();
        assert!(!misc.contains("mbox-host"));
        assert!(misc.open("mbox-host").is_err());
        assert!(matches!(held.write(&[1]), Err(DriverError::NotSupported)));
    }

    struct GoneEndpoint;

    impl FileOperations for GoneEndpoint {
        fn poll(&self, _table: &PollTable) -> PollMask {
            PollMask::HUP
        }
    }

    #[test]
    fn test_wait_for_ends_on_hangup() {
        let misc = MiscRegistry::new();
        misc.register("gone", Arc::new(GoneEndpoint)).unwrap();
        let file = misc.open("gone").unwrap();

        let mask = file.wait_for(PollMask::IN, &Signals::new()).unwrap();
        assert_eq!(mask, PollMask::HUP);
    }

    #[test]
    fn test_ioc_encoding() {
        // Matches the kernel's _IOW(0xb1, 0x00, u8)
        assert_eq!(ioc::iow(0xb1, 0x00, 1), 0x4001_b100);
        assert_eq!(ioc::ior(0xb2, 0x00, 4), 0x8004_b200);
        assert_eq!(ioc::io(0xb2, 0x02), 0x0000_b202);
    }
}

//! Consumer-facing side of the mailbox
//!
//! Readiness is never cached here: the RECV bit in `MBOX_BMC_CTRL` is the
//! only record of a pending inbound frame, and every check reads it.
//!
//! Handles may outlive the driver. Once the endpoint is detached every
//! operation fails with `ResourceUnavailable` and the registers are never
//! touched again.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use cap_broker::RegisterWindow;
use dddk_runtime::{
    ioc, DriverError, FileOperations, IoctlArg, PollMask, PollTable, Result, Signals, WaitQueue,
};
use log::debug;

use super::regs::{data_reg, CtrlBits, MBOX_ATN_REG, MBOX_BMC_CTRL, MBOX_NUM_DATA_REGS};

const MBOX_HOST_IOCTL_MAGIC: u8 = 0xb1;

/// Send the out-of-band attention byte given as the integer parameter
pub const MBOX_HOST_IOCTL_ATN: u32 = ioc::iow(MBOX_HOST_IOCTL_MAGIC, 0x00, core::mem::size_of::<u8>());

/// Mailbox endpoint shared by consumers, the interrupt handler and the poll
/// timer
pub struct MboxEndpoint {
    regs: Arc<dyn RegisterWindow>,
    queue: Arc<WaitQueue>,
    // Held for reading across every register access
    detached: RwLock<bool>,
}

impl MboxEndpoint {
    pub(crate) fn new(regs: Arc<dyn RegisterWindow>, queue: Arc<WaitQueue>) -> Self {
        Self {
            regs,
            queue,
            detached: RwLock::new(false),
        }
    }

    /// Guard that keeps the endpoint attached while held
    fn attached(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let guard = self.detached.read().unwrap_or_else(PoisonError::into_inner);
        if *guard {
            return Err(DriverError::ResourceUnavailable(
                "mbox-host: device detached".into(),
            ));
        }
        Ok(guard)
    }

    /// Cut the endpoint off from the registers and wake blocked readers
    ///
    /// Waits for any register access in progress. Afterwards no operation
    /// touches the registers.
    pub(crate) fn detach(&self) {
        *self.detached.write().unwrap_or_else(PoisonError::into_inner) = true;
        self.queue.wake_up();
    }

    pub fn is_detached(&self) -> bool {
        *self.detached.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn recv_pending(&self) -> bool {
        CtrlBits::from_bits_retain(self.regs.read8(MBOX_BMC_CTRL)).contains(CtrlBits::RECV)
    }

    /// Whether an inbound frame is waiting; never true once detached
    pub fn is_readable(&self) -> bool {
        self.attached().is_ok_and(|_attached| self.recv_pending())
    }

    /// Queue woken when the device may have changed state
    pub fn queue(&self) -> &Arc<WaitQueue> {
        &self.queue
    }

    /// Receive one frame
    ///
    /// Blocks until the peer has asserted RECV, copies the payload slots into
    /// `buf`, then clears RECV. The clear also unmasks the interrupt, which
    /// hands the mailbox back to the peer.
    ///
    /// # Arguments
    /// * `buf` - Destination, at least [`MBOX_NUM_DATA_REGS`] bytes
    /// * `signals` - Cancellation token of the calling context
    ///
    /// # Errors
    /// * `Fault` if `buf` cannot hold a frame; nothing is read
    /// * `Interrupted` if a signal arrives before a frame does; the frame, if
    ///   any, stays pending
    /// * `ResourceUnavailable` if the endpoint is or becomes detached
    pub fn read(&self, buf: &mut [u8], signals: &Signals) -> Result<usize> {
        if buf.len() < MBOX_NUM_DATA_REGS {
            return Err(DriverError::Fault(format!(
                "buffer of {} bytes cannot hold a {}-byte frame",
                buf.len(),
                MBOX_NUM_DATA_REGS
            )));
        }

        // A detach ends the wait too; the guard below reports it
        self.queue
            .wait_event_interruptible(signals, || match self.attached() {
                Ok(_attached) => self.recv_pending(),
                Err(_) => true,
            })?;
        let _attached = self.attached()?;

        for (slot, byte) in buf[..MBOX_NUM_DATA_REGS].iter_mut().enumerate() {
            *byte = self.regs.read8(data_reg(slot));
        }

        // Must come after the copy: the peer may refill the slots once RECV drops.
        self.regs.write8(MBOX_BMC_CTRL, CtrlBits::RECV.bits());

        debug!("mbox-host: received {:02x?}", &buf[..MBOX_NUM_DATA_REGS]);
        Ok(MBOX_NUM_DATA_REGS)
    }

    /// Send one frame
    ///
    /// Copies up to [`MBOX_NUM_DATA_REGS`] bytes into the payload slots and
    /// asserts SEND. Slots past the end of `buf` keep their previous
    /// contents. Does not wait for the peer.
    ///
    /// Returns the number of bytes placed in the frame. An empty `buf`
    /// sends nothing.
    ///
    /// # Errors
    /// Returns `ResourceUnavailable` once the endpoint is detached
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let _attached = self.attached()?;
        let count = buf.len().min(MBOX_NUM_DATA_REGS);
        if count == 0 {
            return Ok(0);
        }

        for (slot, &byte) in buf[..count].iter().enumerate() {
            self.regs.write8(data_reg(slot), byte);
        }
        self.regs.write8(MBOX_BMC_CTRL, CtrlBits::SEND.bits());

        debug!("mbox-host: sent {:02x?}", &buf[..count]);
        Ok(count)
    }

    /// Write the attention byte
    ///
    /// Independent of the frame protocol: RECV and SEND are not touched.
    pub fn signal(&self, byte: u8) -> Result<()> {
        let _attached = self.attached()?;
        self.regs.write8(data_reg(MBOX_ATN_REG), byte);
        debug!("mbox-host: attention {:#04x}", byte);
        Ok(())
    }

    /// Register with the readiness queue, then sample RECV
    ///
    /// Registration comes first so a frame arriving between the two steps
    /// still fires `table`.
    ///
    /// # Errors
    /// Returns `ResourceUnavailable` once the endpoint is detached; `table`
    /// is not registered
    pub fn poll_readable(&self, table: &PollTable) -> Result<bool> {
        let _attached = self.attached()?;
        table.register(&self.queue);
        Ok(self.recv_pending())
    }
}

impl FileOperations for MboxEndpoint {
    fn read(&self, buf: &mut [u8], signals: &Signals) -> Result<usize> {
        MboxEndpoint::read(self, buf, signals)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        MboxEndpoint::write(self, buf)
    }

    fn ioctl(&self, cmd: u32, arg: IoctlArg<'_>) -> Result<()> {
        match cmd {
            MBOX_HOST_IOCTL_ATN => {
                let value = arg.value()?;
                let byte = u8::try_from(value).map_err(|_| {
                    DriverError::InvalidArgument(format!("attention byte {value:#x} out of range"))
                })?;
                self.signal(byte)
            }
            _ => Err(DriverError::InvalidArgument(format!(
                "unknown control code {cmd:#x}"
            ))),
        }
    }

    fn poll(&self, table: &PollTable) -> PollMask {
        match self.poll_readable(table) {
            Ok(true) => PollMask::IN,
            Ok(false) => PollMask::empty(),
            Err(_) => PollMask::ERR | PollMask::HUP,
        }
    }
}

//! Notification sources: what wakes readers when a frame arrives
//!
//! A driver instance owns exactly one source for its whole lifetime. With an
//! interrupt line, the handler masks the interrupt and wakes readers; RECV is
//! left for the reader to clear. Without one, a poll timer wakes readers on a
//! fixed period and they sample RECV themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cap_broker::{CapabilityBroker, IrqHandler, IrqRegistration, IrqReturn, RegisterWindow};
use dddk_runtime::{PollTimer, Result, WaitQueue};
use log::trace;

use super::regs::{CtrlBits, MBOX_BMC_CTRL};

/// Interrupt handler for the mailbox line
///
/// The line may be shared, so an interrupt without RECV set belongs to some
/// other device and is declined.
pub(crate) struct MboxIrq {
    regs: Arc<dyn RegisterWindow>,
    queue: Arc<WaitQueue>,
    handled: AtomicU64,
}

impl MboxIrq {
    pub(crate) fn new(regs: Arc<dyn RegisterWindow>, queue: Arc<WaitQueue>) -> Self {
        Self {
            regs,
            queue,
            handled: AtomicU64::new(0),
        }
    }
}

impl IrqHandler for MboxIrq {
    fn handle(&self, irq: u32) -> IrqReturn {
        let ctrl = CtrlBits::from_bits_retain(self.regs.read8(MBOX_BMC_CTRL));
        if !ctrl.contains(CtrlBits::RECV) {
            return IrqReturn::None;
        }

        // Mask only; RECV stays set until a reader has copied the frame out.
        self.regs.write8(MBOX_BMC_CTRL, CtrlBits::MASK.bits());
        self.queue.wake_up();

        let n = self.handled.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("mbox-host: irq {} handled ({} total)", irq, n);
        IrqReturn::Handled
    }
}

/// The one mechanism that wakes readers
pub enum NotificationSource {
    /// Bound interrupt line
    Interrupt(IrqRegistration),

    /// Periodic poll timer
    Timer(PollTimer),
}

impl NotificationSource {
    /// Arm a poll timer that wakes `queue`
    pub(crate) fn timer(
        initial_delay: Duration,
        period: Duration,
        queue: Arc<WaitQueue>,
    ) -> Result<Self> {
        let timer = PollTimer::start("mbox-host-poll", initial_delay, period, move || {
            queue.wake_up()
        })?;
        Ok(NotificationSource::Timer(timer))
    }

    /// Interrupt line in use, if any
    pub fn irq(&self) -> Option<u32> {
        match self {
            NotificationSource::Interrupt(registration) => Some(registration.irq()),
            NotificationSource::Timer(_) => None,
        }
    }

    /// The poll timer, if this source is one
    pub fn poll_timer(&self) -> Option<&PollTimer> {
        match self {
            NotificationSource::Interrupt(_) => None,
            NotificationSource::Timer(timer) => Some(timer),
        }
    }

    /// Stop the source
    ///
    /// On return no handler or timer callback is running and none will run
    /// again.
    pub(crate) fn quiesce(self, broker: &mut dyn CapabilityBroker) -> Result<()> {
        match self {
            NotificationSource::Interrupt(registration) => broker.free_irq(registration)?,
            NotificationSource::Timer(mut timer) => timer.cancel(),
        }
        Ok(())
    }
}

impl core::fmt::Debug for NotificationSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NotificationSource::Interrupt(registration) => {
                write!(f, "Interrupt({})", registration.irq())
            }
            NotificationSource::Timer(timer) => write!(f, "Timer({:?})", timer.period()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_broker::RamWindow;

    #[test]
    fn test_handler_declines_without_recv() {
        let regs = Arc::new(RamWindow::new(0x100));
        let queue = Arc::new(WaitQueue::new());
        let irq = MboxIrq::new(regs.clone(), queue.clone());

        assert_eq!(irq.handle(7), IrqReturn::None);
        assert_eq!(regs.read8(MBOX_BMC_CTRL), 0);
        assert_eq!(queue.wakeups(), 0);
    }

    #[test]
    fn test_handler_masks_and_wakes() {
        let regs = Arc::new(RamWindow::new(0x100));
        let queue = Arc::new(WaitQueue::new());
        let irq = MboxIrq::new(regs.clone(), queue.clone());

        regs.write8(MBOX_BMC_CTRL, CtrlBits::RECV.bits());
        assert_eq!(irq.handle(7), IrqReturn::Handled);
        assert_eq!(regs.read8(MBOX_BMC_CTRL), CtrlBits::MASK.bits());
        assert_eq!(queue.wakeups(), 1);
    }
}

//! Simulated mailbox controller
//!
//! A register-level model of the controller for host testing and the
//! `mbox-sim` tool. The driver sees it through [`RegisterWindow`] like real
//! hardware; the BMC side is driven through the peer methods.
//!
//! Modelled behaviour of `MBOX_BMC_CTRL` writes from the host:
//! - RECV clears RECV and MASK together
//! - MASK sets MASK
//! - SEND sets SEND
//!
//! `MBOX_STATUS_*` are write-one-to-clear. Every other offset is plain
//! storage.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cap_broker::{IrqReturn, IrqTable, RamWindow, RegisterWindow};
use log::trace;

use crate::mbox_host::regs::{
    data_reg, CtrlBits, MBOX_ATN_REG, MBOX_BMC_CTRL, MBOX_NUM_DATA_REGS, MBOX_STATUS_0,
    MBOX_STATUS_1,
};

/// Register window size of the simulated controller
pub const SIM_MBOX_SIZE: usize = 0x100;

struct IrqLine {
    table: Arc<IrqTable>,
    irq: u32,
}

/// Simulated mailbox controller
pub struct SimMailbox {
    cells: RamWindow,
    /// Host writes to `MBOX_BMC_CTRL`, in order; also serialises every
    /// read-modify-write of the control register
    ctrl_writes: Mutex<Vec<u8>>,
    line: Mutex<Option<IrqLine>>,
}

impl SimMailbox {
    pub fn new() -> Self {
        Self {
            cells: RamWindow::new(SIM_MBOX_SIZE),
            ctrl_writes: Mutex::new(Vec::new()),
            line: Mutex::new(None),
        }
    }

    fn ctrl_lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.ctrl_writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ctrl(&self) -> CtrlBits {
        CtrlBits::from_bits_retain(self.cells.read8(MBOX_BMC_CTRL))
    }

    fn set_ctrl(&self, ctrl: CtrlBits) {
        self.cells.write8(MBOX_BMC_CTRL, ctrl.bits());
    }

    /// Wire the controller's interrupt output to `irq` on `table`
    pub fn connect_irq(&self, table: Arc<IrqTable>, irq: u32) {
        *self.line.lock().unwrap_or_else(PoisonError::into_inner) = Some(IrqLine { table, irq });
    }

    /// Raise the interrupt line if one is connected
    ///
    /// Usable on its own to inject interrupts the mailbox did not cause.
    pub fn pulse_irq(&self) -> Option<IrqReturn> {
        let line = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        line.as_ref().map(|l| l.table.raise(l.irq))
    }

    /// Peer: post an inbound frame
    ///
    /// Fills the payload slots with up to [`MBOX_NUM_DATA_REGS`] bytes of
    /// `frame`, sets RECV and raises the interrupt unless it is masked.
    /// Returns `false` without changing anything while the previous frame is
    /// still unread.
    pub fn deliver(&self, frame: &[u8]) -> bool {
        let masked = {
            let _ctrl = self.ctrl_lock();
            let ctrl = self.ctrl();
            if ctrl.contains(CtrlBits::RECV) {
                return false;
            }

            for (slot, &byte) in frame.iter().take(MBOX_NUM_DATA_REGS).enumerate() {
                self.cells.write8(data_reg(slot), byte);
            }
            self.set_ctrl(ctrl | CtrlBits::RECV);
            ctrl.contains(CtrlBits::MASK)
        };

        trace!("sim-mbox: peer delivered {:02x?}", frame);
        if !masked {
            self.pulse_irq();
        }
        true
    }

    /// Peer: collect an outbound frame
    ///
    /// Returns the payload slots and acknowledges SEND, or `None` if the host
    /// has not sent anything.
    pub fn take_outbound(&self) -> Option<[u8; MBOX_NUM_DATA_REGS]> {
        let _ctrl = self.ctrl_lock();
        let ctrl = self.ctrl();
        if !ctrl.contains(CtrlBits::SEND) {
            return None;
        }

        let mut frame = [0u8; MBOX_NUM_DATA_REGS];
        for (slot, byte) in frame.iter_mut().enumerate() {
            *byte = self.cells.read8(data_reg(slot));
        }
        self.set_ctrl(ctrl - CtrlBits::SEND);
        Some(frame)
    }

    /// Peer: the last attention byte written by the host
    pub fn attention(&self) -> u8 {
        self.cells.read8(data_reg(MBOX_ATN_REG))
    }

    /// Peer: raise status bits
    pub fn set_status(&self, status0: u8, status1: u8) {
        self.cells.write8(MBOX_STATUS_0, self.cells.read8(MBOX_STATUS_0) | status0);
        self.cells.write8(MBOX_STATUS_1, self.cells.read8(MBOX_STATUS_1) | status1);
    }

    /// Whether an inbound frame is waiting for the host
    pub fn recv_pending(&self) -> bool {
        self.ctrl().contains(CtrlBits::RECV)
    }

    pub fn masked(&self) -> bool {
        self.ctrl().contains(CtrlBits::MASK)
    }

    /// Every value the host has written to `MBOX_BMC_CTRL`
    pub fn ctrl_writes(&self) -> Vec<u8> {
        self.ctrl_lock().clone()
    }
}

impl Default for SimMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterWindow for SimMailbox {
    fn read8(&self, offset: usize) -> u8 {
        self.cells.read8(offset)
    }

    fn write8(&self, offset: usize, value: u8) {
        match offset {
            MBOX_BMC_CTRL => {
                let mut writes = self.ctrl_lock();
                writes.push(value);

                let written = CtrlBits::from_bits_retain(value);
                let mut ctrl = self.ctrl();
                if written.contains(CtrlBits::RECV) {
                    ctrl -= CtrlBits::RECV | CtrlBits::MASK;
                }
                if written.contains(CtrlBits::MASK) {
                    ctrl |= CtrlBits::MASK;
                }
                if written.contains(CtrlBits::SEND) {
                    ctrl |= CtrlBits::SEND;
                }
                self.set_ctrl(ctrl);
                trace!("sim-mbox: ctrl write {:#04x} -> {:?}", value, ctrl);
            }
            MBOX_STATUS_0 | MBOX_STATUS_1 => {
                self.cells.write8(offset, self.cells.read8(offset) & !value);
            }
            _ => self.cells.write8(offset, value),
        }
    }

    fn size(&self) -> usize {
        self.cells.size()
    }
}

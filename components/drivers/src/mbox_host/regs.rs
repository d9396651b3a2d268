//! Mailbox controller register map
//!
//! All registers are 8 bits wide on a 4-byte stride.

use bitflags::bitflags;
use static_assertions::const_assert;

/// Data slots in the register bank
pub const MBOX_NUM_REGS: usize = 16;

/// Slots that carry a frame; one frame per RECV/SEND cycle
pub const MBOX_NUM_DATA_REGS: usize = 14;

/// Slot reserved for the out-of-band attention byte
pub const MBOX_ATN_REG: usize = 15;

pub const MBOX_DATA_0: usize = 0x00;
pub const MBOX_STATUS_0: usize = 0x40;
pub const MBOX_STATUS_1: usize = 0x44;
pub const MBOX_BMC_CTRL: usize = 0x48;
pub const MBOX_HOST_CTRL: usize = 0x4c;
pub const MBOX_INTERRUPT_0: usize = 0x50;
pub const MBOX_INTERRUPT_1: usize = 0x54;

/// Bytes spanned by the register bank
pub const MBOX_REG_SPAN: usize = MBOX_INTERRUPT_1 + 4;

const_assert!(MBOX_NUM_DATA_REGS < MBOX_ATN_REG);
const_assert!(MBOX_ATN_REG < MBOX_NUM_REGS);
const_assert!(MBOX_DATA_0 + MBOX_NUM_REGS * 4 <= MBOX_STATUS_0);

bitflags! {
    /// `MBOX_BMC_CTRL` bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtrlBits: u8 {
        /// Inbound frame ready. Write-one-to-clear; clearing also unmasks.
        const RECV = 0x80;
        /// Suppress the interrupt for a set RECV without clearing it
        const MASK = 0x02;
        /// Outbound frame ready for the peer
        const SEND = 0x01;
    }
}

/// Offset of data slot `slot`
pub const fn data_reg(slot: usize) -> usize {
    MBOX_DATA_0 + slot * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_offsets() {
        assert_eq!(data_reg(0), 0x00);
        assert_eq!(data_reg(MBOX_NUM_DATA_REGS - 1), 0x34);
        assert_eq!(data_reg(MBOX_ATN_REG), 0x3c);
        assert!(MBOX_REG_SPAN <= 0x100);
    }
}

//! IRQ Handling - Interrupt line management
//!
//! Each interrupt line carries a chain of handlers. A line requested with
//! [`IrqFlags::SHARED`] may be joined by other shared handlers; the first
//! exclusive request locks everyone else out.
//!
//! Dispatch walks the chain and asks every handler whether the interrupt was
//! its own. A handler that finds nothing pending on its device must answer
//! [`IrqReturn::None`] so the line can be claimed by a neighbour.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bitflags::bitflags;

use crate::{CapabilityError, Result};

bitflags! {
    /// Options for binding a handler to a line
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        /// Line may be shared with other handlers
        const SHARED = 1 << 0;
    }
}

/// Result of a handler invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt was not raised by this handler's device
    None,

    /// The interrupt was serviced
    Handled,
}

/// An interrupt handler
///
/// # Context
/// Called in interrupt context. Must be fast and must never block.
pub trait IrqHandler: Send + Sync {
    fn handle(&self, irq: u32) -> IrqReturn;
}

impl<F> IrqHandler for F
where
    F: Fn(u32) -> IrqReturn + Send + Sync,
{
    fn handle(&self, irq: u32) -> IrqReturn {
        self(irq)
    }
}

/// Proof that a handler is bound to a line
///
/// Hand it back to [`IrqTable::free`] (or the broker's `free_irq`) to unbind.
#[derive(Debug, PartialEq, Eq)]
pub struct IrqRegistration {
    irq: u32,
    id: u64,
    name: String,
}

impl IrqRegistration {
    /// Get the IRQ number
    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Name the handler was registered under
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct IrqAction {
    id: u64,
    flags: IrqFlags,
    handler: Arc<dyn IrqHandler>,
}

/// Interrupt line table
///
/// Dispatch holds the table's read lock for the whole handler walk, and
/// [`free`](IrqTable::free) takes the write lock. A handler that has been
/// freed is therefore guaranteed not to be running anymore.
pub struct IrqTable {
    lines: RwLock<HashMap<u32, Vec<IrqAction>>>,
    next_id: AtomicU64,
    spurious: AtomicU64,
}

impl IrqTable {
    pub fn new() -> Self {
        Self {
            lines: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            spurious: AtomicU64::new(0),
        }
    }

    /// Bind a handler to a line
    ///
    /// # Errors
    /// Returns `IrqBusy` if the line already has handlers and either side
    /// did not ask for sharing
    pub fn request(
        &self,
        irq: u32,
        flags: IrqFlags,
        name: &str,
        handler: Arc<dyn IrqHandler>,
    ) -> Result<IrqRegistration> {
        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        let chain = lines.entry(irq).or_default();

        let shareable = flags.contains(IrqFlags::SHARED)
            && chain.iter().all(|a| a.flags.contains(IrqFlags::SHARED));
        if !chain.is_empty() && !shareable {
            return Err(CapabilityError::IrqBusy { irq });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        chain.push(IrqAction { id, flags, handler });
        log::debug!("irq {}: bound {} ({} handler(s))", irq, name, chain.len());

        Ok(IrqRegistration {
            irq,
            id,
            name: name.into(),
        })
    }

    /// Unbind a handler
    ///
    /// Waits for any dispatch in progress to finish first.
    pub fn free(&self, registration: IrqRegistration) -> Result<()> {
        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        let chain = lines.get_mut(&registration.irq);

        let removed = chain.and_then(|chain| {
            let index = chain.iter().position(|a| a.id == registration.id)?;
            Some(chain.remove(index))
        });

        match removed {
            Some(_) => {
                log::debug!("irq {}: released {}", registration.irq, registration.name);
                Ok(())
            }
            None => Err(CapabilityError::IrqNotRegistered {
                irq: registration.irq,
                name: registration.name,
            }),
        }
    }

    /// Deliver an interrupt on a line
    ///
    /// Every handler on the chain is invoked. Returns `Handled` if at least
    /// one of them claimed the interrupt.
    pub fn raise(&self, irq: u32) -> IrqReturn {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);

        let mut result = IrqReturn::None;
        for action in lines.get(&irq).into_iter().flatten() {
            if action.handler.handle(irq) == IrqReturn::Handled {
                result = IrqReturn::Handled;
            }
        }

        if result == IrqReturn::None {
            self.spurious.fetch_add(1, Ordering::Relaxed);
            log::trace!("irq {}: nobody claimed it", irq);
        }
        result
    }

    /// Number of handlers bound to a line
    pub fn handler_count(&self, irq: u32) -> usize {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        lines.get(&irq).map_or(0, Vec::len)
    }

    /// Interrupts that no handler claimed
    pub fn spurious_count(&self) -> u64 {
        self.spurious.load(Ordering::Relaxed)
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

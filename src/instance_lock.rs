//! Process-wide instance slots.
//!
//! The controller owns exactly one broker connection and one hardware daemon
//! connection for its whole lifetime. Each of those resources claims a static
//! slot when it is constructed; a second construction while the first is
//! still alive fails instead of silently opening a second connection.

use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Slot claimed by the MQTT broker connection.
pub static BROKER_SLOT: InstanceSlot = InstanceSlot::new("message broker");

/// Slot claimed by the GPIO/I2C daemon connection.
pub static HARDWARE_SLOT: InstanceSlot = InstanceSlot::new("hardware access");

/// Error returned when a process-wide resource is constructed twice.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Another instance of the resource is already alive.
    #[error("{0} instance already created")]
    AlreadyCreated(&'static str),
}

/// A named, process-wide "at most one alive" marker.
pub struct InstanceSlot {
    name: &'static str,
    taken: AtomicBool,
}

impl InstanceSlot {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            taken: AtomicBool::new(false),
        }
    }

    /// Claim the slot.
    ///
    /// The returned lock holds the slot until it is dropped.
    pub fn acquire(&'static self) -> Result<InstanceLock, LifecycleError> {
        if self
            .taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LifecycleError::AlreadyCreated(self.name));
        }
        Ok(InstanceLock { slot: self })
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }
}

/// Proof of ownership of an [`InstanceSlot`].
pub struct InstanceLock {
    slot: &'static InstanceSlot,
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.slot.taken.store(false, Ordering::Release);
    }
}

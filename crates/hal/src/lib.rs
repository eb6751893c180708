#![cfg_attr(not(any(test, feature = "std")), no_std)]

// Platform seam for the Xen frontends.
// Root holds the lock and error types; the hypervisor surface lives in traits.

extern crate alloc;

pub mod barrier;
pub mod dma;
pub mod interrupts;
pub mod rendez;
pub mod traits;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use dma::{pages_for, DmaRegion, PAGE_SIZE};
pub use rendez::Rendez;
pub use traits::{DomainId, EventChannelHandler, Port, XenHal};

use xf_error::define_driver_error;
use xf_utils::{Mutex, MutexGuard};

define_driver_error! {
    /// Failures reported by the platform layer.
    pub enum HalError(0x01) {
        /// No memory for shared pages
        OutOfMemory = 0x01 => "Out of DMA memory",
        /// Event channel could not be allocated or bound
        NoPort = 0x02 => "Event channel unavailable",
        /// Hypervisor refused the grant table frames
        GrantSetup = 0x03 => "Grant table setup failed",
        /// Background task could not be started
        Spawn = 0x04 => "Task spawn failed",
    }
}

/// Spin lock taken with local interrupts masked.
///
/// Event-channel handlers run in interrupt context and touch the same state
/// as task code (grant free list, framebuffer surfaces). Holding this lock
/// keeps such a handler from interrupting the holder on the same CPU.
pub struct IrqSafeLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSafeLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqSafeLockGuard<'_, T> {
        let irq = IrqMask::take();
        IrqSafeLockGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }

    /// Like [`lock`](Self::lock), but gives up at once if the lock is held.
    pub fn try_lock(&self) -> Option<IrqSafeLockGuard<'_, T>> {
        let irq = IrqMask::take();
        let guard = self.inner.try_lock()?;
        Some(IrqSafeLockGuard { guard, _irq: irq })
    }
}

/// Interrupt state saved on entry, restored on drop.
struct IrqMask(u64);

impl IrqMask {
    fn take() -> Self {
        Self(interrupts::disable())
    }
}

impl Drop for IrqMask {
    fn drop(&mut self) {
        interrupts::restore(self.0);
    }
}

/// Fields drop in order: the spin lock is released before interrupts return.
pub struct IrqSafeLockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _irq: IrqMask,
}

impl<T> core::ops::Deref for IrqSafeLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> core::ops::DerefMut for IrqSafeLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupts_masked_while_held() {
        let free_list = IrqSafeLock::new(alloc::vec![3u32, 2, 1]);
        assert!(interrupts::is_enabled());
        {
            let mut refs = free_list.lock();
            assert!(!interrupts::is_enabled());
            refs.pop();
        }
        assert!(interrupts::is_enabled());
        assert_eq!(*free_list.lock(), [3, 2]);
    }

    #[test]
    fn test_nested_locks_restore_outer_state() {
        let grants = IrqSafeLock::new(0u32);
        let surfaces = IrqSafeLock::new(0u32);
        let g = grants.lock();
        let s = surfaces.lock();
        drop(s);
        assert!(!interrupts::is_enabled());
        drop(g);
        assert!(interrupts::is_enabled());
    }

    #[test]
    fn test_try_lock_under_contention() {
        let lock = IrqSafeLock::new(());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        // still masked by `held`
        assert!(!interrupts::is_enabled());
        drop(held);
        assert!(interrupts::is_enabled());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_hal_error_codes() {
        assert_eq!(HalError::OutOfMemory.code(), 0x0101);
        assert_eq!(HalError::Spawn.code(), 0x0104);
    }
}

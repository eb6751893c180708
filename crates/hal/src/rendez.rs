//! Single-waiter rendezvous between an event-channel handler and one task.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::traits::{EventChannelHandler, Port, XenHal};

/// A wakeup latch for exactly one sleeping task.
///
/// `wakeup` may run in interrupt context. A wakeup that arrives before the
/// task sleeps is not lost: the pending flag makes the next check run at once.
/// The sleeper always re-evaluates its condition, so spurious wakeups are
/// harmless.
pub struct Rendez {
    pending: AtomicBool,
}

impl Rendez {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    pub fn wakeup(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Block until `cond` returns true.
    pub fn sleep<H: XenHal + ?Sized>(&self, hal: &H, mut cond: impl FnMut() -> bool) {
        loop {
            if cond() {
                return;
            }
            if self.pending.swap(false, Ordering::AcqRel) {
                continue;
            }
            hal.idle();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl Default for Rendez {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannelHandler for Rendez {
    fn handle(&self, _port: Port) {
        self.wakeup();
    }
}

//! Memory barriers for memory shared with another domain.
//!
//! The remote side is another guest on another CPU, so compiler ordering
//! alone is not enough: every helper here emits a hardware fence.

use core::sync::atomic::{fence, Ordering};

/// Order earlier loads before later loads.
#[inline(always)]
pub fn rmb() {
    fence(Ordering::Acquire);
}

/// Order earlier stores before later stores.
#[inline(always)]
pub fn wmb() {
    fence(Ordering::Release);
}

/// Full barrier: loads and stores on both sides.
#[inline(always)]
pub fn mb() {
    fence(Ordering::SeqCst);
    #[cfg(target_arch = "aarch64")]
    {
        use aarch64_cpu::asm::barrier;
        barrier::dsb(barrier::ISH);
    }
}

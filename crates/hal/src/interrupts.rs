//! Local interrupt mask.
//!
//! Bare-metal builds touch the CPU flags directly. Hosted builds used for
//! tests get a per-thread mock so lock behaviour stays observable.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod arch {
    use aarch64_cpu::registers::{Readable, Writeable, DAIF};

    #[inline(always)]
    pub fn disable() -> u64 {
        let state = DAIF.get();
        // SAFETY: daifset is an immediate-only instruction not provided by aarch64-cpu
        unsafe { core::arch::asm!("msr daifset, #2") };
        state
    }

    #[inline(always)]
    pub fn restore(state: u64) {
        DAIF.set(state);
    }

    #[inline(always)]
    pub fn is_enabled() -> bool {
        // IRQ mask is bit 7
        (DAIF.get() & (1 << 7)) == 0
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    const IF: u64 = 0x200;

    #[inline(always)]
    fn rflags() -> u64 {
        let flags: u64;
        // SAFETY: reading RFLAGS has no side effects
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) flags, options(nomem)) };
        flags
    }

    #[inline(always)]
    pub fn disable() -> u64 {
        let flags = rflags();
        // SAFETY: masking interrupts on the local CPU
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
        flags
    }

    #[inline(always)]
    pub fn restore(state: u64) {
        if state & IF != 0 {
            // SAFETY: interrupts were enabled when the matching disable() ran
            unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
        }
    }

    #[inline(always)]
    pub fn is_enabled() -> bool {
        rflags() & IF != 0
    }
}

#[cfg(all(not(target_os = "none"), any(test, feature = "std")))]
mod arch {
    use std::cell::Cell;

    thread_local! {
        static ENABLED: Cell<bool> = const { Cell::new(true) };
    }

    pub fn disable() -> u64 {
        let prev = is_enabled();
        ENABLED.with(|e| e.set(false));
        u64::from(prev)
    }

    pub fn restore(state: u64) {
        ENABLED.with(|e| e.set(state != 0));
    }

    pub fn is_enabled() -> bool {
        ENABLED.with(Cell::get)
    }
}

#[cfg(all(
    not(target_os = "none"),
    not(any(test, feature = "std"))
))]
mod arch {
    pub fn disable() -> u64 {
        0
    }

    pub fn restore(state: u64) {
        let _ = state;
    }

    pub fn is_enabled() -> bool {
        true
    }
}

/// Mask interrupts on this CPU and return the previous state.
#[inline(always)]
pub fn disable() -> u64 {
    arch::disable()
}

/// Restore a state returned by [`disable`].
#[inline(always)]
pub fn restore(state: u64) {
    arch::restore(state);
}

#[inline(always)]
pub fn is_enabled() -> bool {
    arch::is_enabled()
}

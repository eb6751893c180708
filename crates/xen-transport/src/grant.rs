//! Grant table (v1) and reference allocator.
//!
//! Free references are threaded through a `next` array: `next[r]` is the free
//! reference after `r`, and reference 0 terminates the chain. The chain is
//! seeded descending, so the first grant handed out is the highest reference.

use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU16, Ordering};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use xf_hal::{barrier, DomainId, IrqSafeLock, XenHal, PAGE_SIZE};

use crate::GrantError;

/// Grant table frames mapped at boot.
pub const DEFAULT_GRANT_FRAMES: usize = 4;

bitflags! {
    /// `grant_entry_v1.flags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GrantFlags: u16 {
        const PERMIT_ACCESS = 1;
        const ACCEPT_TRANSFER = 2;
        /// Remote may only map the frame read-only.
        const READONLY = 1 << 2;
        /// Set by the hypervisor while the remote has the frame mapped for reading.
        const READING = 1 << 3;
        /// Set by the hypervisor while the remote has the frame mapped for writing.
        const WRITING = 1 << 4;
    }
}

impl GrantFlags {
    /// Aliases of bits 2 and 3 for transfer grants.
    pub const TRANSFER_COMMITTED: Self = Self::READONLY;
    pub const TRANSFER_COMPLETED: Self = Self::READING;

    const TYPE_MASK: u16 = 0b11;

    pub fn is_transfer(self) -> bool {
        self.bits() & Self::TYPE_MASK == Self::ACCEPT_TRANSFER.bits()
    }
}

/// One entry of the shared table, as the hypervisor sees it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GrantEntry {
    pub flags: u16,
    pub domid: u16,
    pub frame: u32,
}

const _: () = assert!(core::mem::size_of::<GrantEntry>() == 8);

/// Index into the grant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantRef(pub u32);

impl GrantRef {
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for GrantRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct FreeList {
    next: Vec<u32>,
    head: u32,
    available: usize,
}

impl FreeList {
    fn seeded(len: usize) -> Self {
        // next[0] is never followed; the chain stops when head reaches 0.
        let next = (0..len as u32).map(|i| i.saturating_sub(1)).collect();
        Self {
            next,
            head: len.saturating_sub(1) as u32,
            available: len.saturating_sub(1),
        }
    }

    fn pop(&mut self) -> Option<u32> {
        let r = self.head;
        if r == 0 {
            return None;
        }
        self.head = self.next[r as usize];
        self.available -= 1;
        Some(r)
    }

    fn push(&mut self, r: u32) {
        self.next[r as usize] = self.head;
        self.head = r;
        self.available += 1;
    }
}

/// The shared grant table plus its free-reference chain.
pub struct GrantTable {
    entries: NonNull<GrantEntry>,
    len: usize,
    free: IrqSafeLock<FreeList>,
}

// SAFETY: entries are only written under the free-list discipline (one owner per
// active reference) and flag words are accessed atomically.
unsafe impl Send for GrantTable {}
// SAFETY: see above
unsafe impl Sync for GrantTable {}

impl GrantTable {
    /// Map `nr_frames` table frames through the platform.
    pub fn setup<H: XenHal>(hal: &H, nr_frames: usize) -> Result<Self, GrantError> {
        let base = hal
            .setup_grant_table(nr_frames)
            .ok_or(GrantError::SetupFailed)?;
        let len = nr_frames * PAGE_SIZE / core::mem::size_of::<GrantEntry>();
        log::info!("[GNTTAB] {} frames, {} references", nr_frames, len - 1);
        // SAFETY: XenHal guarantees the mapping covers nr_frames pages for its lifetime
        Ok(unsafe { Self::from_raw(base.cast(), len) })
    }

    /// Wrap an already-mapped table of `len` entries.
    ///
    /// # Safety
    ///
    /// `entries` must point to `len` grant entries that stay mapped while the
    /// table exists, and no other allocator may manage them.
    pub unsafe fn from_raw(entries: NonNull<GrantEntry>, len: usize) -> Self {
        Self {
            entries,
            len,
            free: IrqSafeLock::new(FreeList::seeded(len)),
        }
    }

    /// Usable references (reference 0 is reserved).
    pub fn capacity(&self) -> usize {
        self.len.saturating_sub(1)
    }

    pub fn available(&self) -> usize {
        self.free.lock().available
    }

    /// Grant `domid` access to `frame`.
    pub fn grant_access(&self, domid: DomainId, frame: u64, readonly: bool) -> GrantRef {
        let mut flags = GrantFlags::PERMIT_ACCESS;
        if readonly {
            flags |= GrantFlags::READONLY;
        }
        self.grant(domid, frame, flags)
    }

    /// Publish a grant entry and return its reference.
    ///
    /// Frame and domain become visible before the flags that activate them.
    #[allow(clippy::panic)]
    pub fn grant(&self, domid: DomainId, frame: u64, flags: GrantFlags) -> GrantRef {
        let Ok(frame32) = u32::try_from(frame) else {
            panic!("[GNTTAB] frame {frame:#x} does not fit a v1 grant entry");
        };
        let Some(r) = self.free.lock().pop() else {
            panic!("[GNTTAB] out of grant references ({} in table)", self.len);
        };

        let entry = self.entry(r);
        // SAFETY: r came off the free list, so no one else writes this entry
        unsafe {
            core::ptr::addr_of_mut!((*entry).frame).write_volatile(frame32);
            core::ptr::addr_of_mut!((*entry).domid).write_volatile(domid);
        }
        barrier::wmb();
        self.flags_word(r).store(flags.bits(), Ordering::Release);
        log::trace!("[GNTTAB] grant {} frame {:#x} dom {} {:?}", r, frame, domid, flags);
        GrantRef(r)
    }

    /// Revoke `gref` and return the frame it covered.
    ///
    /// The remote side must have released the frame: revoking an entry the
    /// hypervisor still marks as reading or writing, or a transfer that has
    /// not completed, is fatal.
    #[allow(clippy::panic)]
    pub fn end_access(&self, gref: GrantRef) -> u64 {
        let r = gref.0;
        assert!(r != 0 && (r as usize) < self.len, "[GNTTAB] bad reference {r}");

        barrier::mb();
        let flags = self.flags(gref);
        if flags.is_transfer() {
            if !flags.contains(GrantFlags::TRANSFER_COMPLETED) {
                panic!("[GNTTAB] revoke {r}: transfer in progress");
            }
        } else if flags.intersects(GrantFlags::READING | GrantFlags::WRITING) {
            panic!("[GNTTAB] revoke {r}: frame in use ({flags:?})");
        }
        barrier::mb();

        let entry = self.entry(r);
        // SAFETY: r is active and owned by the caller
        let frame = unsafe { core::ptr::addr_of!((*entry).frame).read_volatile() };
        self.flags_word(r).store(0, Ordering::Release);
        self.free.lock().push(r);
        log::trace!("[GNTTAB] revoke {} frame {:#x}", r, frame);
        u64::from(frame)
    }

    /// Current flags of `gref`, including bits set by the hypervisor.
    pub fn flags(&self, gref: GrantRef) -> GrantFlags {
        GrantFlags::from_bits_retain(self.flags_word(gref.0).load(Ordering::Acquire))
    }

    pub fn frame_of(&self, gref: GrantRef) -> u64 {
        // SAFETY: index checked by entry()
        u64::from(unsafe { core::ptr::addr_of!((*self.entry(gref.0)).frame).read_volatile() })
    }

    pub fn domid_of(&self, gref: GrantRef) -> DomainId {
        // SAFETY: index checked by entry()
        unsafe { core::ptr::addr_of!((*self.entry(gref.0)).domid).read_volatile() }
    }

    fn entry(&self, r: u32) -> *mut GrantEntry {
        assert!((r as usize) < self.len);
        // SAFETY: r < len
        unsafe { self.entries.as_ptr().add(r as usize) }
    }

    fn flags_word(&self, r: u32) -> &AtomicU16 {
        // SAFETY: flags is the first, 2-aligned field of a live entry; the
        // hypervisor updates it with atomic operations as well
        unsafe { AtomicU16::from_ptr(core::ptr::addr_of_mut!((*self.entry(r)).flags)) }
    }

    /// Simulate the hypervisor setting or clearing status bits.
    #[cfg(any(test, feature = "mock"))]
    pub fn remote_set_flags(&self, gref: GrantRef, set: GrantFlags, clear: GrantFlags) {
        let word = self.flags_word(gref.0);
        let cur = word.load(Ordering::Acquire);
        word.store((cur | set.bits()) & !clear.bits(), Ordering::Release);
    }
}

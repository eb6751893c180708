//! Bidirectional shared ring (`sring`) with request and response index pairs.
//!
//! The shared page starts with a 64-byte header
//! `{ req_prod, req_event, rsp_prod, rsp_event, pad[48] }` followed by a
//! power-of-two array of slots, each large enough for either a request or a
//! response. The front end owns `req_prod` and `rsp_event`; the back end owns
//! `rsp_prod` and `req_event`. Private counters (`req_prod_pvt`, `rsp_cons`)
//! never leave the local side.
//!
//! All indices are free-running `u32`s that wrap; slot = index & (size - 1).

use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;
use xf_hal::barrier;

use crate::RingError;

/// Size of the shared header in front of the slot array.
pub const SRING_HEADER_SIZE: usize = 64;

const REQ_PROD: usize = 0;
const REQ_EVENT: usize = 4;
const RSP_PROD: usize = 8;
const RSP_EVENT: usize = 12;

/// Slot size for a ring carrying `Req` and `Rsp`.
pub const fn slot_size<Req, Rsp>() -> usize {
    let req = core::mem::size_of::<Req>();
    let rsp = core::mem::size_of::<Rsp>();
    if req > rsp {
        req
    } else {
        rsp
    }
}

/// Number of slots that fit in `bytes` of shared memory: the largest power of
/// two not exceeding `(bytes - header) / slot`.
pub const fn ring_size(bytes: usize, slot: usize) -> u32 {
    if slot == 0 || bytes < SRING_HEADER_SIZE + slot {
        return 0;
    }
    let n = (bytes - SRING_HEADER_SIZE) / slot;
    1 << (usize::BITS - 1 - n.leading_zeros())
}

/// "Needs notify" test shared by both directions: the peer asked to be woken
/// at `event`, and `old..new` are the entries just published.
#[inline]
pub fn needs_notify(new: u32, old: u32, event: u32) -> bool {
    new.wrapping_sub(event) < new.wrapping_sub(old)
}

/// Header words of a shared ring page.
struct Shared {
    base: NonNull<u8>,
}

impl Shared {
    fn word(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: offset is a 4-aligned header field inside the mapped page
        unsafe { AtomicU32::from_ptr(self.base.as_ptr().add(offset).cast()) }
    }

    fn slot(&self, index: u32, size: u32, slot: usize) -> *mut u8 {
        let i = (index & (size - 1)) as usize;
        // SAFETY: i < size and the page holds `size` slots after the header
        unsafe { self.base.as_ptr().add(SRING_HEADER_SIZE + i * slot) }
    }

    /// SHARED_RING_INIT: indices start at zero, event thresholds at one.
    fn init(&self, start: u32) {
        self.word(REQ_PROD).store(start, Ordering::Relaxed);
        self.word(RSP_PROD).store(start, Ordering::Relaxed);
        self.word(REQ_EVENT).store(start.wrapping_add(1), Ordering::Relaxed);
        self.word(RSP_EVENT).store(start.wrapping_add(1), Ordering::Relaxed);
        // SAFETY: pad bytes 16..64 belong to the header
        unsafe { core::ptr::write_bytes(self.base.as_ptr().add(16), 0, SRING_HEADER_SIZE - 16) };
        barrier::wmb();
    }
}

/// Front (request-producing) end of a shared ring.
pub struct FrontRing<Req, Rsp> {
    shared: Shared,
    size: u32,
    req_prod_pvt: u32,
    rsp_cons: u32,
    _marker: PhantomData<(Req, Rsp)>,
}

// SAFETY: the ring only touches memory it was handed in init(); access from
// more than one task is serialized by the owner (&mut self).
unsafe impl<Req: Send, Rsp: Send> Send for FrontRing<Req, Rsp> {}

impl<Req: Pod, Rsp: Pod> FrontRing<Req, Rsp> {
    const SLOT: usize = slot_size::<Req, Rsp>();

    /// Initialize the shared header and attach as the front end.
    ///
    /// # Safety
    ///
    /// `page` must be writable, 8-aligned, at least `bytes` long and stay
    /// mapped for the ring's lifetime.
    pub unsafe fn init(page: NonNull<u8>, bytes: usize) -> Result<Self, RingError> {
        Self::init_at(page, bytes, 0)
    }

    /// Like [`init`](Self::init) but with all indices starting at `start`.
    ///
    /// # Safety
    ///
    /// Same as [`init`](Self::init).
    pub unsafe fn init_at(page: NonNull<u8>, bytes: usize, start: u32) -> Result<Self, RingError> {
        let size = ring_size(bytes, Self::SLOT);
        if size == 0 {
            return Err(RingError::TooSmall);
        }
        let shared = Shared { base: page };
        shared.init(start);
        log::debug!("[RING] front ring: {} slots of {} bytes", size, Self::SLOT);
        Ok(Self {
            shared,
            size,
            req_prod_pvt: start,
            rsp_cons: start,
            _marker: PhantomData,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Slots not occupied by unconsumed requests or responses.
    pub fn free_requests(&self) -> u32 {
        self.size
            .saturating_sub(self.req_prod_pvt.wrapping_sub(self.rsp_cons))
    }

    pub fn is_full(&self) -> bool {
        self.free_requests() == 0
    }

    /// Copy `req` into the next request slot. Not visible to the back end
    /// until [`push_requests_and_check_notify`](Self::push_requests_and_check_notify).
    pub fn push_request(&mut self, req: &Req) -> Result<(), RingError> {
        if self.is_full() {
            return Err(RingError::Full);
        }
        let slot = self.shared.slot(self.req_prod_pvt, self.size, Self::SLOT);
        // SAFETY: slot is inside the page and suitably aligned for Req
        unsafe { slot.cast::<Req>().write_volatile(*req) };
        self.req_prod_pvt = self.req_prod_pvt.wrapping_add(1);
        Ok(())
    }

    /// Publish privately produced requests; true if the back end must be notified.
    pub fn push_requests_and_check_notify(&mut self) -> bool {
        let old = self.shared.word(REQ_PROD).load(Ordering::Relaxed);
        let new = self.req_prod_pvt;
        // Slot contents before the index that exposes them.
        barrier::wmb();
        self.shared.word(REQ_PROD).store(new, Ordering::Release);
        // Index visible before reading the peer's event threshold.
        barrier::mb();
        let event = self.shared.word(REQ_EVENT).load(Ordering::Acquire);
        needs_notify(new, old, event)
    }

    /// Responses published by the back end and not yet taken.
    pub fn unconsumed_responses(&self) -> u32 {
        let prod = self.shared.word(RSP_PROD).load(Ordering::Acquire);
        barrier::rmb();
        prod.wrapping_sub(self.rsp_cons)
    }

    /// Check for responses, re-arming `rsp_event` so the back end notifies us
    /// for the next one if there is none yet.
    pub fn final_check_for_responses(&mut self) -> bool {
        if self.unconsumed_responses() > 0 {
            return true;
        }
        self.shared
            .word(RSP_EVENT)
            .store(self.rsp_cons.wrapping_add(1), Ordering::Release);
        barrier::mb();
        self.unconsumed_responses() > 0
    }

    /// Take the next response, if any.
    pub fn take_response(&mut self) -> Option<Rsp> {
        if self.unconsumed_responses() == 0 {
            return None;
        }
        let slot = self.shared.slot(self.rsp_cons, self.size, Self::SLOT);
        // SAFETY: the back end published this slot and will not touch it until
        // rsp_cons moves past it
        let rsp = unsafe { slot.cast::<Rsp>().read_volatile() };
        barrier::mb();
        self.rsp_cons = self.rsp_cons.wrapping_add(1);
        Some(rsp)
    }

    /// Private producer index.
    pub fn req_prod_pvt(&self) -> u32 {
        self.req_prod_pvt
    }

    pub fn rsp_cons(&self) -> u32 {
        self.rsp_cons
    }
}

/// Back (response-producing) end of a shared ring, used to emulate a backend.
#[cfg(any(test, feature = "mock"))]
pub struct BackRing<Req, Rsp> {
    shared: Shared,
    size: u32,
    rsp_prod_pvt: u32,
    req_cons: u32,
    _marker: PhantomData<(Req, Rsp)>,
}

#[cfg(any(test, feature = "mock"))]
// SAFETY: same discipline as FrontRing
unsafe impl<Req: Send, Rsp: Send> Send for BackRing<Req, Rsp> {}

#[cfg(any(test, feature = "mock"))]
impl<Req: Pod, Rsp: Pod> BackRing<Req, Rsp> {
    const SLOT: usize = slot_size::<Req, Rsp>();

    /// Attach to a ring the front end already initialized.
    ///
    /// # Safety
    ///
    /// `page` must be the live, initialized shared page of a front ring of
    /// `bytes` bytes.
    pub unsafe fn attach(page: NonNull<u8>, bytes: usize) -> Self {
        let shared = Shared { base: page };
        let start = shared.word(RSP_PROD).load(Ordering::Acquire);
        Self {
            size: ring_size(bytes, Self::SLOT),
            shared,
            rsp_prod_pvt: start,
            req_cons: start,
            _marker: PhantomData,
        }
    }

    pub fn unconsumed_requests(&self) -> u32 {
        let prod = self.shared.word(REQ_PROD).load(Ordering::Acquire);
        barrier::rmb();
        prod.wrapping_sub(self.req_cons)
    }

    pub fn take_request(&mut self) -> Option<Req> {
        if self.unconsumed_requests() == 0 {
            return None;
        }
        let slot = self.shared.slot(self.req_cons, self.size, Self::SLOT);
        // SAFETY: published by the front end
        let req = unsafe { slot.cast::<Req>().read_volatile() };
        self.req_cons = self.req_cons.wrapping_add(1);
        Some(req)
    }

    /// Re-arm `req_event`; true if requests arrived meanwhile.
    pub fn final_check_for_requests(&mut self) -> bool {
        if self.unconsumed_requests() > 0 {
            return true;
        }
        self.shared
            .word(REQ_EVENT)
            .store(self.req_cons.wrapping_add(1), Ordering::Release);
        barrier::mb();
        self.unconsumed_requests() > 0
    }

    pub fn push_response(&mut self, rsp: &Rsp) {
        let slot = self.shared.slot(self.rsp_prod_pvt, self.size, Self::SLOT);
        // SAFETY: the slot belongs to a consumed request
        unsafe { slot.cast::<Rsp>().write_volatile(*rsp) };
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
    }

    pub fn push_responses_and_check_notify(&mut self) -> bool {
        let old = self.shared.word(RSP_PROD).load(Ordering::Relaxed);
        let new = self.rsp_prod_pvt;
        barrier::wmb();
        self.shared.word(RSP_PROD).store(new, Ordering::Release);
        barrier::mb();
        let event = self.shared.word(RSP_EVENT).load(Ordering::Acquire);
        needs_notify(new, old, event)
    }
}

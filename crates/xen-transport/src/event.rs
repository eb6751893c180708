//! Unidirectional event rings (back end produces, front end consumes).
//!
//! Unlike the `sring` control ring, event pages use fixed offsets per protocol
//! and a ring length that need not be a power of two, so slots are indexed
//! with `idx % RING_LEN`.

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;
use xf_hal::{barrier, DomainId, HalError, Port, Rendez, XenHal, PAGE_SIZE};

use crate::grant::{GrantRef, GrantTable};
use crate::shared::SharedPages;

/// Placement of the indices and slots inside an event page.
pub trait EventLayout: Send + Sync + 'static {
    const CONS_OFFSET: usize;
    const PROD_OFFSET: usize;
    const RING_OFFSET: usize;
    const RING_LEN: u32;

    type Event: Pod;
}

/// View over an event page.
pub struct EventRing<L: EventLayout> {
    page: NonNull<u8>,
    _layout: PhantomData<L>,
}

// SAFETY: indices are accessed atomically; only the consumer side writes in_cons
unsafe impl<L: EventLayout> Send for EventRing<L> {}
// SAFETY: see above
unsafe impl<L: EventLayout> Sync for EventRing<L> {}

impl<L: EventLayout> EventRing<L> {
    const EVENT_SIZE: usize = core::mem::size_of::<L::Event>();
    const FITS: () = assert!(
        L::RING_OFFSET + L::RING_LEN as usize * core::mem::size_of::<L::Event>() <= PAGE_SIZE
    );

    /// # Safety
    ///
    /// `page` must be a mapped, zeroed or protocol-initialized event page that
    /// outlives the view.
    pub unsafe fn new(page: NonNull<u8>) -> Self {
        let () = Self::FITS;
        Self {
            page,
            _layout: PhantomData,
        }
    }

    fn index(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: offsets are 4-aligned header fields of the page
        unsafe { AtomicU32::from_ptr(self.page.as_ptr().add(offset).cast()) }
    }

    fn slot(&self, idx: u32) -> *mut L::Event {
        let i = (idx % L::RING_LEN) as usize;
        // SAFETY: FITS guarantees every slot lies inside the page
        unsafe { self.page.as_ptr().add(L::RING_OFFSET + i * Self::EVENT_SIZE).cast() }
    }

    /// Events published and not yet consumed.
    pub fn available(&self) -> u32 {
        let prod = self.index(L::PROD_OFFSET).load(Ordering::Acquire);
        barrier::rmb();
        prod.wrapping_sub(self.index(L::CONS_OFFSET).load(Ordering::Relaxed))
    }

    /// Hand every published event to `f` in order, then release the slots.
    /// Returns the number of events consumed.
    pub fn drain(&self, mut f: impl FnMut(&L::Event)) -> u32 {
        let prod = self.index(L::PROD_OFFSET).load(Ordering::Acquire);
        barrier::rmb();
        let mut cons = self.index(L::CONS_OFFSET).load(Ordering::Relaxed);
        let start = cons;
        while cons != prod {
            // SAFETY: slot lies between cons and prod, owned by us until in_cons moves
            let event = unsafe { self.slot(cons).read_volatile() };
            f(&event);
            cons = cons.wrapping_add(1);
        }
        // Slots read before they are handed back.
        barrier::mb();
        self.index(L::CONS_OFFSET).store(cons, Ordering::Release);
        cons.wrapping_sub(start)
    }

    /// Publish `event` as the back end would. Returns false if the ring is full.
    #[cfg(any(test, feature = "mock"))]
    pub fn produce(&self, event: &L::Event) -> bool {
        let prod = self.index(L::PROD_OFFSET).load(Ordering::Relaxed);
        let cons = self.index(L::CONS_OFFSET).load(Ordering::Acquire);
        if prod.wrapping_sub(cons) >= L::RING_LEN {
            return false;
        }
        // SAFETY: slot is free: the consumer has released it
        unsafe { self.slot(prod).write_volatile(*event) };
        barrier::wmb();
        self.index(L::PROD_OFFSET).store(prod.wrapping_add(1), Ordering::Release);
        true
    }

    /// Move both indices to `start`, for exercising index wraparound.
    #[cfg(any(test, feature = "mock"))]
    pub fn reset_to(&self, start: u32) {
        self.index(L::CONS_OFFSET).store(start, Ordering::Relaxed);
        self.index(L::PROD_OFFSET).store(start, Ordering::Release);
    }
}

/// Event page shared with the back end, its notification port and the task
/// that waits on it.
///
/// Only one task may wait or drain at a time.
pub struct EventConsumer<H: XenHal, L: EventLayout> {
    hal: Arc<H>,
    ring: EventRing<L>,
    page: SharedPages<H>,
    port: Port,
    rendez: Arc<Rendez>,
}

impl<H: XenHal, L: EventLayout> EventConsumer<H, L> {
    /// Allocate and grant the event page, open a port to `backend` and bind it.
    pub fn new(hal: &Arc<H>, grants: &Arc<GrantTable>, backend: DomainId) -> Result<Self, HalError> {
        let page = SharedPages::new(hal, grants, backend, 1)?;
        let port = hal.alloc_unbound_port(backend)?;
        let rendez = Arc::new(Rendez::new());
        if let Err(e) = hal.bind_port(port, rendez.clone()) {
            hal.close_port(port);
            return Err(e);
        }
        // SAFETY: the page is owned by `page`, which lives as long as the ring
        let ring = unsafe { EventRing::new(page.as_ptr()) };
        log::debug!("[RING] event ring: gref {} port {}", page.gref(0), port);
        Ok(Self {
            hal: hal.clone(),
            ring,
            page,
            port,
            rendez,
        })
    }

    pub fn gref(&self) -> GrantRef {
        self.page.gref(0)
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn ring(&self) -> &EventRing<L> {
        &self.ring
    }

    pub fn available(&self) -> u32 {
        self.ring.available()
    }

    /// Wake the waiting task so it re-checks its stop condition.
    pub fn kick(&self) {
        self.rendez.wakeup();
    }

    /// Block until events are available or `stop` returns true.
    /// Returns false if stopped with nothing to drain.
    pub fn wait(&self, stop: impl Fn() -> bool) -> bool {
        self.rendez
            .sleep(&*self.hal, || stop() || self.ring.available() > 0);
        self.ring.available() > 0
    }

    /// Drain all published events, then tell the back end the slots are free.
    pub fn drain(&self, f: impl FnMut(&L::Event)) -> u32 {
        let n = self.ring.drain(f);
        self.hal.notify(self.port);
        n
    }

    /// One iteration of the consumer loop: wait, then drain.
    /// Returns None once `stop` is observed with an empty ring.
    pub fn wait_and_drain(&self, stop: impl Fn() -> bool, f: impl FnMut(&L::Event)) -> Option<u32> {
        if self.wait(stop) {
            Some(self.drain(f))
        } else {
            None
        }
    }
}

impl<H: XenHal, L: EventLayout> Drop for EventConsumer<H, L> {
    fn drop(&mut self) {
        self.hal.unbind_port(self.port);
        self.hal.close_port(self.port);
        log::debug!("[RING] event ring on port {} closed", self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;
    use xf_hal::mock::MockHal;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
    struct Rec {
        tag: u32,
        seq: u32,
        pad: [u32; 8],
    }

    /// Odd ring length to exercise modulo indexing.
    struct TestLayout;

    impl EventLayout for TestLayout {
        const CONS_OFFSET: usize = 0;
        const PROD_OFFSET: usize = 4;
        const RING_OFFSET: usize = 1024;
        const RING_LEN: u32 = 51;
        type Event = Rec;
    }

    fn rec(seq: u32) -> Rec {
        Rec { tag: 1, seq, pad: [0; 8] }
    }

    fn consumer() -> (Arc<MockHal>, Arc<GrantTable>, EventConsumer<MockHal, TestLayout>) {
        let hal = MockHal::new();
        let grants = Arc::new(GrantTable::setup(&*hal, 1).unwrap());
        let consumer = EventConsumer::new(&hal, &grants, 0).unwrap();
        (hal, grants, consumer)
    }

    #[test]
    fn test_drain_in_order_and_notify() {
        let (hal, _grants, ev) = consumer();
        for seq in 0..5 {
            assert!(ev.ring().produce(&rec(seq)));
        }
        assert_eq!(ev.available(), 5);

        let mut seen = Vec::new();
        assert_eq!(ev.drain(|e| seen.push(e.seq)), 5);
        assert_eq!(seen, [0, 1, 2, 3, 4]);
        assert_eq!(ev.available(), 0);
        assert_eq!(hal.notifications(ev.port()), 1);
    }

    #[test]
    fn test_full_ring_and_wraparound() {
        let (_hal, _grants, ev) = consumer();
        ev.ring().reset_to(u32::MAX - 20);

        for round in 0..3u32 {
            for i in 0..TestLayout::RING_LEN {
                assert!(ev.ring().produce(&rec(round * 100 + i)));
            }
            assert!(!ev.ring().produce(&rec(0)));

            let mut seen = Vec::new();
            ev.drain(|e| seen.push(e.seq));
            let expected: Vec<u32> = (0..TestLayout::RING_LEN).map(|i| round * 100 + i).collect();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn test_wait_wakes_on_event() {
        let (hal, _grants, ev) = consumer();
        let port = ev.port();
        let ring_page = ev.ring().page.as_ptr() as usize;

        let remote = std::thread::spawn({
            let hal = hal.clone();
            move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                // SAFETY: page stays alive until the consumer is dropped below
                let ring = unsafe { EventRing::<TestLayout>::new(NonNull::new(ring_page as *mut u8).unwrap()) };
                ring.produce(&rec(42));
                hal.raise(port);
            }
        });

        let got = ev.wait_and_drain(|| false, |e| assert_eq!(e.seq, 42));
        assert_eq!(got, Some(1));
        remote.join().unwrap();
    }

    #[test]
    fn test_wait_returns_on_stop() {
        let (_hal, _grants, ev) = consumer();
        assert_eq!(ev.wait_and_drain(|| true, |_| {}), None);
    }

    #[test]
    fn test_drop_releases_everything() {
        let (hal, grants, ev) = consumer();
        let port = ev.port();
        assert_eq!(grants.available(), grants.capacity() - 1);
        drop(ev);
        assert!(!hal.is_bound(port));
        assert!(!hal.is_open(port));
        assert_eq!(grants.available(), grants.capacity());
        assert_eq!(hal.live_regions(), 0);
    }
}

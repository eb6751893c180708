//! Synchronous request/response calls over a control ring.
//!
//! One request is in flight per channel. Callers are serialized by the
//! channel itself: a second caller waits (cooperatively) until the first
//! call has returned to `Idle`.
//!
//! Waiters are not queued. Each display has at most two callers (its flip
//! task and the thread running bring-up or shutdown), and shutdown stops the
//! flip task before it issues requests, so at most one caller ever waits.
//! With more contending callers the order in which they get the ring is
//! unspecified.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use bytemuck::Pod;
use xf_hal::{DomainId, Port, Rendez, XenHal, PAGE_SIZE};
use xf_utils::{Mutex, MutexGuard};

use crate::grant::{GrantRef, GrantTable};
use crate::ring::FrontRing;
use crate::shared::SharedPages;
use crate::RingError;

/// A request that can travel on a control ring.
pub trait ControlRequest: Pod + Send {
    fn set_id(&mut self, id: u16);
    fn id(&self) -> u16;
    fn operation(&self) -> u8;
}

/// A response read back from a control ring.
pub trait ControlResponse: Pod + Send {
    fn id(&self) -> u16;
    fn operation(&self) -> u8;
    /// Zero on success, negative errno otherwise.
    fn status(&self) -> i32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Request `id` is on the ring; waiting for its response.
    Sent { id: u16 },
}

/// Counters kept by a channel.
#[derive(Debug, Default)]
pub struct CallStats {
    pub requests: AtomicU64,
    pub responses: AtomicU64,
    pub failed_status: AtomicU64,
    pub stale_responses: AtomicU64,
}

struct Engine<Req, Rsp> {
    ring: FrontRing<Req, Rsp>,
    state: CallState,
    next_id: u16,
}

/// Control ring, its page and notification port.
pub struct ControlChannel<H: XenHal, Req, Rsp> {
    hal: Arc<H>,
    engine: Mutex<Engine<Req, Rsp>>,
    state: Mutex<CallState>,
    page: SharedPages<H>,
    port: Port,
    rendez: Arc<Rendez>,
    stats: CallStats,
}

impl<H: XenHal, Req: ControlRequest, Rsp: ControlResponse> ControlChannel<H, Req, Rsp> {
    /// Allocate and initialize the ring page, grant it to `backend`, and
    /// open and bind a port for response notifications.
    pub fn new(hal: &Arc<H>, grants: &Arc<GrantTable>, backend: DomainId) -> Result<Self, RingError> {
        let page = SharedPages::new(hal, grants, backend, 1)?;
        // SAFETY: page is zeroed, page-aligned and owned by the channel
        let ring = unsafe { FrontRing::init(page.as_ptr(), PAGE_SIZE)? };
        let port = hal.alloc_unbound_port(backend)?;
        let rendez = Arc::new(Rendez::new());
        if let Err(e) = hal.bind_port(port, rendez.clone()) {
            hal.close_port(port);
            return Err(e.into());
        }
        log::debug!("[RING] control ring: gref {} port {} slots {}", page.gref(0), port, ring.size());
        Ok(Self {
            hal: hal.clone(),
            engine: Mutex::new(Engine {
                ring,
                state: CallState::Idle,
                next_id: 0,
            }),
            state: Mutex::new(CallState::Idle),
            page,
            port,
            rendez,
            stats: CallStats::default(),
        })
    }

    pub fn gref(&self) -> GrantRef {
        self.page.gref(0)
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Take the engine, yielding to the platform between attempts. No
    /// fairness between waiters.
    fn acquire(&self) -> MutexGuard<'_, Engine<Req, Rsp>> {
        loop {
            if let Some(engine) = self.engine.try_lock() {
                return engine;
            }
            self.hal.idle();
        }
    }

    fn set_state(&self, engine: &mut Engine<Req, Rsp>, state: CallState) {
        engine.state = state;
        *self.state.lock() = state;
    }

    /// Send `req` and block until the response carrying its id arrives.
    ///
    /// A nonzero response status is logged and counted; the response is
    /// returned either way so the caller can inspect `status()`.
    pub fn call(&self, mut req: Req) -> Result<Rsp, RingError> {
        let mut engine = self.acquire();
        debug_assert_eq!(engine.state, CallState::Idle);

        let id = engine.next_id;
        engine.next_id = id.wrapping_add(1);
        req.set_id(id);
        engine.ring.push_request(&req)?;
        self.set_state(&mut engine, CallState::Sent { id });
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        if engine.ring.push_requests_and_check_notify() {
            self.hal.notify(self.port);
        }
        log::trace!("[RING] request id {} op {:#x}", id, req.operation());

        loop {
            self.rendez
                .sleep(&*self.hal, || engine.ring.final_check_for_responses());

            while let Some(rsp) = engine.ring.take_response() {
                self.hal.notify(self.port);
                self.stats.responses.fetch_add(1, Ordering::Relaxed);

                if rsp.id() != id {
                    self.stats.stale_responses.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[RING] dropping response id {} (waiting for {})", rsp.id(), id);
                    continue;
                }
                if rsp.status() != 0 {
                    self.stats.failed_status.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "[RING] response id {} op {:#x} status {}",
                        rsp.id(),
                        rsp.operation(),
                        rsp.status()
                    );
                }
                self.set_state(&mut engine, CallState::Idle);
                log::trace!("[RING] response id {} op {:#x}", id, rsp.operation());
                return Ok(rsp);
            }
        }
    }
}

impl<H: XenHal, Req, Rsp> Drop for ControlChannel<H, Req, Rsp> {
    fn drop(&mut self) {
        self.hal.unbind_port(self.port);
        self.hal.close_port(self.port);
        log::debug!("[RING] control ring on port {} closed", self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ControlResponder;
    use bytemuck::Zeroable;
    use std::sync::Arc;
    use std::vec::Vec;
    use xf_hal::mock::MockHal;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
    struct Req {
        id: u16,
        op: u8,
        pad: u8,
        arg: u32,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
    struct Rsp {
        id: u16,
        op: u8,
        pad: u8,
        status: i32,
    }

    impl ControlRequest for Req {
        fn set_id(&mut self, id: u16) {
            self.id = id;
        }
        fn id(&self) -> u16 {
            self.id
        }
        fn operation(&self) -> u8 {
            self.op
        }
    }

    impl ControlResponse for Rsp {
        fn id(&self) -> u16 {
            self.id
        }
        fn operation(&self) -> u8 {
            self.op
        }
        fn status(&self) -> i32 {
            self.status
        }
    }

    fn req(op: u8, arg: u32) -> Req {
        Req { id: 0, op, pad: 0, arg }
    }

    fn echo(r: &Req) -> Rsp {
        Rsp {
            id: r.id,
            op: r.op,
            pad: 0,
            status: -(r.arg as i32),
        }
    }

    type Channel = ControlChannel<MockHal, Req, Rsp>;

    fn channel() -> (Arc<MockHal>, Arc<GrantTable>, Arc<Channel>) {
        let hal = MockHal::new();
        let grants = Arc::new(GrantTable::setup(&*hal, 1).unwrap());
        let channel = Arc::new(Channel::new(&hal, &grants, 0).unwrap());
        (hal, grants, channel)
    }

    /// Back end answering synchronously from the notify hook.
    fn serve(hal: &Arc<MockHal>, channel: &Channel, extra: impl Fn(&MockHal) + Send + Sync + 'static) {
        // SAFETY: the page outlives the hook for the duration of each test
        let responder = Arc::new(unsafe { ControlResponder::<Req, Rsp>::attach(channel.page.as_ptr()) });
        let port = channel.port();
        let weak = Arc::downgrade(hal);
        hal.set_remote(move |p| {
            let Some(hal) = weak.upgrade() else { return };
            if p == port {
                extra(&hal);
                responder.service(&hal, port, echo);
            }
        });
    }

    #[test]
    fn test_call_returns_matching_response() {
        let (hal, _grants, ch) = channel();
        serve(&hal, &ch, |_| {});

        let rsp = ch.call(req(0x10, 0)).unwrap();
        assert_eq!((rsp.id, rsp.op, rsp.status), (0, 0x10, 0));
        let rsp = ch.call(req(0x11, 0)).unwrap();
        assert_eq!((rsp.id, rsp.op), (1, 0x11));
        assert_eq!(ch.state(), CallState::Idle);
        assert_eq!(ch.stats().requests.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_nonzero_status_is_returned_not_raised() {
        let (hal, _grants, ch) = channel();
        serve(&hal, &ch, |_| {});

        let rsp = ch.call(req(0x14, 22)).unwrap();
        assert_eq!(rsp.status, -22);
        assert_eq!(ch.stats().failed_status.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unrelated_notifications_do_not_confuse_call() {
        let (hal, _grants, ch) = channel();
        let other = hal.alloc_unbound_port(0).unwrap();
        let other_rendez = Arc::new(Rendez::new());
        hal.bind_port(other, other_rendez.clone()).unwrap();

        // Fire spurious wakeups on our port and events on another port before
        // the real answer is produced.
        let port = ch.port();
        serve(&hal, &ch, move |hal| {
            hal.raise(other);
            hal.raise(port);
            hal.raise(other);
        });

        for op in 0..40u8 {
            let rsp = ch.call(req(op, 0)).unwrap();
            assert_eq!(rsp.op, op);
            assert_eq!(rsp.id, u16::from(op));
        }
        assert!(other_rendez.is_pending());
    }

    #[test]
    fn test_stale_response_is_skipped() {
        let (hal, _grants, ch) = channel();
        // SAFETY: page lives as long as the channel
        let responder = Arc::new(unsafe { ControlResponder::<Req, Rsp>::attach(ch.page.as_ptr()) });
        let port = ch.port();
        let weak = Arc::downgrade(&hal);
        let injected = core::sync::atomic::AtomicBool::new(false);
        hal.set_remote(move |p| {
            let Some(hal) = weak.upgrade() else { return };
            if p == port && !injected.swap(true, Ordering::SeqCst) {
                responder.push_unsolicited(&Rsp {
                    id: 100,
                    op: 3,
                    pad: 0,
                    status: 0,
                });
                responder.service(&hal, port, echo);
            }
        });

        let rsp = ch.call(req(3, 0)).unwrap();
        assert_eq!(rsp.id, 0);
        assert_eq!(ch.stats().stale_responses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_concurrent_callers_are_serialized() {
        let (hal, _grants, ch) = channel();
        let ch2 = ch.clone();

        // Threaded back end: answers whatever is on the ring, slowly.
        // SAFETY: page lives as long as the channel
        let responder = Arc::new(unsafe { ControlResponder::<Req, Rsp>::attach(ch.page.as_ptr()) });
        let done = Arc::new(core::sync::atomic::AtomicBool::new(false));
        let backend = std::thread::spawn({
            let (hal, done, port) = (hal.clone(), done.clone(), ch.port());
            move || {
                while !done.load(Ordering::Acquire) {
                    responder.service(&hal, port, echo);
                    std::thread::sleep(std::time::Duration::from_micros(300));
                }
            }
        });

        let worker = std::thread::spawn(move || {
            (0..20u32).map(|i| ch2.call(req(1, i)).unwrap().status).collect::<Vec<_>>()
        });
        let mine: Vec<i32> = (0..20u32).map(|i| ch.call(req(2, i)).unwrap().status).collect();
        let theirs = worker.join().unwrap();

        let expected: Vec<i32> = (0..20).map(|i: i32| -i).collect();
        assert_eq!(mine, expected);
        assert_eq!(theirs, expected);
        assert_eq!(ch.stats().responses.load(Ordering::Relaxed), 40);

        done.store(true, Ordering::Release);
        backend.join().unwrap();
    }

    #[test]
    fn test_drop_closes_port_and_revokes() {
        let (hal, grants, ch) = channel();
        let port = ch.port();
        drop(Arc::try_unwrap(ch).ok().unwrap());
        assert!(!hal.is_open(port));
        assert_eq!(grants.available(), grants.capacity());
        assert_eq!(hal.live_regions(), 0);
    }
}

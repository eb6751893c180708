//! Background task that publishes dirty frames to the backend.
//!
//! Every `flip_period_ms` the task tests and clears the dirty flag. A dirty
//! frame is copied into the device buffer, a PG_FLIP request is sent, and the
//! task then waits for the backend's flip-completion event before looking at
//! the flag again.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use xen_transport::{ControlChannel, EventConsumer};
use xf_hal::{HalError, XenHal};

use crate::framebuffer::FrameBuffers;
use crate::protocol::{Command, DisplEvent, DisplLayout, DisplRequest, DisplResponse, EVT_PG_FLIP};

pub type DisplChannel<H> = ControlChannel<H, DisplRequest, DisplResponse>;
pub type DisplEvents<H> = EventConsumer<H, DisplLayout>;

/// Flip counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlipTelemetry {
    /// PG_FLIP requests acknowledged by the backend.
    pub flips: u64,
    /// Flip-completion events received.
    pub completions: u64,
    /// Events with an unknown type.
    pub unknown_events: u64,
}

pub struct FlipController<H: XenHal> {
    hal: Arc<H>,
    control: Arc<DisplChannel<H>>,
    events: Arc<DisplEvents<H>>,
    buffers: Arc<FrameBuffers<H>>,
    fb_cookie: u64,
    period_ms: u64,
    started: AtomicBool,
    stop: AtomicBool,
    exited: AtomicBool,
    flips: AtomicU64,
    completions: AtomicU64,
    unknown_events: AtomicU64,
}

impl<H: XenHal> FlipController<H> {
    pub fn new(
        hal: &Arc<H>,
        control: &Arc<DisplChannel<H>>,
        events: &Arc<DisplEvents<H>>,
        buffers: &Arc<FrameBuffers<H>>,
        fb_cookie: u64,
        period_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            hal: hal.clone(),
            control: control.clone(),
            events: events.clone(),
            buffers: buffers.clone(),
            fb_cookie,
            period_ms,
            started: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            flips: AtomicU64::new(0),
            completions: AtomicU64::new(0),
            unknown_events: AtomicU64::new(0),
        })
    }

    pub fn start(self: &Arc<Self>) -> Result<(), HalError> {
        let me = self.clone();
        self.started.store(true, Ordering::Release);
        let spawned = self.hal.spawn("vdispl_flip", Box::new(move || me.run()));
        if spawned.is_err() {
            self.started.store(false, Ordering::Release);
        }
        spawned
    }

    pub fn telemetry(&self) -> FlipTelemetry {
        FlipTelemetry {
            flips: self.flips.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            unknown_events: self.unknown_events.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.exited.load(Ordering::Acquire)
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run(&self) {
        log::debug!("[VDISPL] flip task started");
        while !self.stopping() {
            self.hal.sleep_ms(self.period_ms);
            if !self.stopping() {
                self.step();
            }
        }
        self.exited.store(true, Ordering::Release);
        log::debug!("[VDISPL] flip task exited");
    }

    /// One poll period. Returns true if a frame was flipped.
    pub fn step(&self) -> bool {
        if !self.buffers.take_dirty() {
            return false;
        }
        self.buffers.publish();

        let flip = Command::PgFlip {
            fb_cookie: self.fb_cookie,
        };
        if let Err(e) = self.control.call(flip.to_request()) {
            log::error!("[VDISPL] page flip failed: {}", e);
            return false;
        }
        self.flips.fetch_add(1, Ordering::Relaxed);

        self.events
            .wait_and_drain(|| self.stopping(), |ev| self.on_event(ev));
        true
    }

    fn on_event(&self, ev: &DisplEvent) {
        if ev.kind == EVT_PG_FLIP {
            log::trace!("[VDISPL] flip done: id {} fb {:#x}", ev.id, ev.fb_cookie());
            self.completions.fetch_add(1, Ordering::Relaxed);
        } else {
            log::warn!("[VDISPL] unknown event type {:#x}", ev.kind);
            self.unknown_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Ask the task to exit and wait until it has.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.events.kick();
        while self.is_running() {
            self.hal.idle();
        }
    }
}
